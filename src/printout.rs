//! Terminal printout channel, grounded verbatim on `types.rs::Printout`.

use tokio::sync::mpsc;

/// A terminal printout. Verbosity level is from low to high, and for
/// now, only 0 and 1 are used. Level 0 is always printed, level 1 is
/// only printed if the terminal is in verbose mode. Numbers greater
/// than 1 are reserved for future use and will be ignored for now.
#[derive(Clone, Debug)]
pub struct Printout {
    pub verbosity: u8,
    pub content: String,
}

pub type PrintSender = mpsc::Sender<Printout>;
pub type PrintReceiver = mpsc::Receiver<Printout>;

pub fn print_channel(capacity: usize) -> (PrintSender, PrintReceiver) {
    mpsc::channel(capacity)
}

/// Fire-and-forget send: a full or closed printout channel must never block
/// or panic the caller.
pub async fn print(tx: &PrintSender, verbosity: u8, content: impl Into<String>) {
    let _ = tx.try_send(Printout {
        verbosity,
        content: content.into(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn print_is_received_in_order() {
        let (tx, mut rx) = print_channel(8);
        print(&tx, 0, "first").await;
        print(&tx, 1, "second").await;
        assert_eq!(rx.recv().await.unwrap().content, "first");
        assert_eq!(rx.recv().await.unwrap().content, "second");
    }
}
