//! Ping/probe/echo engine: periodic liveness and token-reconciliation
//! messages exchanged with immediate neighbors (spec.md §4.7).
//!
//! Grounded on `original_source/src/prod/src/Federation/PingManager.cpp`/`.h` for cadence,
//! edge-probe triggering, and the inbound handler's shape (update the
//! sender's global-lease view, process its global-time exchange header,
//! reply in kind when the sender's ticket has advanced), and on `timer.rs`
//! for the Rust periodic-task idiom (a background loop driven by
//! `tokio::time::interval`, reporting through a channel rather than
//! blocking its caller).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time;

use crate::contracts::MessageTransport;
use crate::headers::GlobalTimeExchangeHeader;
use crate::instance::NodeInstance;
use crate::lease::LeaseContext;
use crate::printout::{print, PrintSender};
use crate::ring::Ring;
use crate::token_manager::{Direction, TokenManager};

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct PingPayload {
    pub from: NodeInstance,
    pub token_version: u64,
    pub global_time: GlobalTimeExchangeHeader,
}

/// Runs the ping loop until `shutdown` fires. Every `ping_interval`, pings
/// each ping target; an inbound reply that advances the peer's observed
/// ticket is answered with a symmetric ping by `handle_inbound_ping`.
pub async fn run_ping_loop(
    ring: Arc<Mutex<Ring>>,
    token_manager: Arc<Mutex<TokenManager>>,
    transport: Arc<dyn MessageTransport>,
    print_tx: PrintSender,
    ping_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = time::interval(ping_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ping_once(&ring, &token_manager, transport.as_ref(), &print_tx).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn ping_once(ring: &Arc<Mutex<Ring>>, token_manager: &Arc<Mutex<TokenManager>>, transport: &dyn MessageTransport, print_tx: &PrintSender) {
    let targets = {
        let ring = ring.lock().await;
        ring.get_ping_targets()
    };
    let version = token_manager.lock().await.token().version();
    let this = { ring.lock().await.this_node() };
    for target in targets {
        let Some(address) = transport.resolve_address(target.id).await else {
            continue;
        };
        let receiver_upper_limit = {
            let ring = ring.lock().await;
            ring.get(target.id).map(|p| p.global_time_upper_limit.current()).unwrap_or(Duration::ZERO)
        };
        let payload = encode_ping(&PingPayload {
            from: this,
            token_version: version,
            global_time: global_time_header(receiver_upper_limit),
        });
        if transport.send(&target, &address, payload).await.is_err() {
            print(print_tx, 1, format!("ping: send to {} failed", target.id)).await;
        }
    }
}

fn global_time_header(receiver_upper_limit: Duration) -> GlobalTimeExchangeHeader {
    GlobalTimeExchangeHeader {
        epoch: 0,
        send_time: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
        sender_lower_limit: Duration::ZERO,
        receiver_upper_limit,
    }
}

pub fn encode_ping(payload: &PingPayload) -> Vec<u8> {
    bincode::serialize(payload).expect("PingPayload is always serializable")
}

pub fn decode_ping(bytes: &[u8]) -> Result<PingPayload, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Processes an inbound ping (spec.md §4.7): updates whichever lease side
/// the sender occupies (liveness only — lease timers themselves are the
/// lease agent's contract), widens the sender's `GlobalTimeUpperLimit` from
/// its global-time exchange header, and, if the sender's token ticket has
/// advanced past what was last known, answers with a symmetric ping so
/// both sides converge without waiting for the next tick.
pub async fn handle_inbound_ping(
    ring: &Mutex<Ring>,
    lease: &Mutex<LeaseContext>,
    token_manager: &Mutex<TokenManager>,
    transport: &dyn MessageTransport,
    payload: PingPayload,
) {
    let ticket_advanced = {
        let mut ring = ring.lock().await;
        let advanced = ring.get(payload.from.id).map(|p| payload.token_version > p.token.version()).unwrap_or(false);
        if let Some(partner) = ring.get_mut(payload.from.id) {
            partner.touch_access();
            partner.clear_unknown();
            partner
                .global_time_upper_limit
                .refresh(payload.global_time.send_time + payload.global_time.sender_lower_limit);
        }
        advanced
    };

    {
        let mut lease = lease.lock().await;
        if lease.predecessor.partner().map(|p| p.id) == Some(payload.from.id) {
            lease.predecessor.observe_ping();
        }
        if lease.successor.partner().map(|p| p.id) == Some(payload.from.id) {
            lease.successor.observe_ping();
        }
    }

    if !ticket_advanced {
        return;
    }
    let Some(address) = transport.resolve_address(payload.from.id).await else {
        return;
    };
    let this = ring.lock().await.this_node();
    let version = token_manager.lock().await.token().version();
    let receiver_upper_limit = ring
        .lock()
        .await
        .get(payload.from.id)
        .map(|p| p.global_time_upper_limit.current())
        .unwrap_or(Duration::ZERO);
    let reply = PingPayload {
        from: this,
        token_version: version,
        global_time: global_time_header(receiver_upper_limit),
    };
    let _ = transport.send(&payload.from, &address, encode_ping(&reply)).await;
}

/// Edge probe: sent when the local edge's expected partner hasn't answered
/// within an adaptive interval. Delegates the version/distance payload to
/// the token manager and returns the probe so the caller's transport can
/// ship it to `edge`.
pub async fn build_edge_probe(token_manager: &Mutex<TokenManager>, direction: Direction, edge: crate::identifier::NodeId) -> crate::token_manager::ProbeMessage {
    token_manager.lock().await.probe_message(direction, edge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::NodeId;
    use crate::identifier::NodeIdRange;
    use crate::token::RoutingToken;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for CountingTransport {
        async fn send(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_request(
            &self,
            _target: &NodeInstance,
            _address: &str,
            payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, crate::contracts::SendRequestError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(payload)
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            Some("mock".into())
        }
    }

    #[tokio::test]
    async fn ping_once_sends_to_every_target() {
        let this = NodeInstance::new(NodeId::new(0), 1);
        let mut ring = Ring::new(this, "ring".into(), 2);
        let mut p = crate::partner::PartnerNode::new(NodeInstance::new(NodeId::new(10), 1), "ring".into(), Some("a".into()));
        p.phase = crate::partner::Phase::Routing;
        ring.upsert(p);
        let ring = Arc::new(Mutex::new(ring));
        let token_manager = Arc::new(Mutex::new(TokenManager::new(RoutingToken::new(NodeIdRange::FULL, 1), Duration::from_secs(5))));
        let transport = Arc::new(CountingTransport { sent: AtomicUsize::new(0) });
        let (print_tx, _rx) = crate::printout::print_channel(8);

        ping_once(&ring, &token_manager, transport.as_ref(), &print_tx).await;
        assert!(transport.sent.load(Ordering::SeqCst) >= 1);
    }

    fn sample_ping(from: NodeInstance, token_version: u64) -> PingPayload {
        PingPayload {
            from,
            token_version,
            global_time: GlobalTimeExchangeHeader {
                epoch: 0,
                send_time: Duration::from_secs(1),
                sender_lower_limit: Duration::from_millis(1),
                receiver_upper_limit: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn inbound_ping_updates_lease_view_and_suppresses_arbitration() {
        let this = NodeInstance::new(NodeId::new(0), 1);
        let sender = NodeInstance::new(NodeId::new(10), 1);
        let mut ring = Ring::new(this, "ring".into(), 2);
        let mut p = crate::partner::PartnerNode::new(sender, "ring".into(), Some("a".into()));
        p.phase = crate::partner::Phase::Routing;
        ring.upsert(p);
        let ring = Mutex::new(ring);

        let mut lease = LeaseContext::new(Duration::from_secs(10), Duration::from_millis(1), Duration::from_secs(1));
        lease.predecessor.set_partner(sender, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(lease.predecessor.needs_arbitration());
        let lease = Mutex::new(lease);

        let token_manager = Mutex::new(TokenManager::new(RoutingToken::new(NodeIdRange::FULL, 1), Duration::from_secs(5)));
        let transport = CountingTransport { sent: AtomicUsize::new(0) };

        handle_inbound_ping(&ring, &lease, &token_manager, &transport, sample_ping(sender, 0)).await;

        assert!(!lease.lock().await.predecessor.needs_arbitration());
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0, "no ticket advance, no reply expected");
    }

    #[tokio::test]
    async fn inbound_ping_with_advanced_ticket_replies_symmetrically() {
        let this = NodeInstance::new(NodeId::new(0), 1);
        let sender = NodeInstance::new(NodeId::new(10), 1);
        let mut ring = Ring::new(this, "ring".into(), 2);
        let mut p = crate::partner::PartnerNode::new(sender, "ring".into(), Some("a".into()));
        p.phase = crate::partner::Phase::Routing;
        ring.upsert(p);
        let ring = Mutex::new(ring);
        let lease = Mutex::new(LeaseContext::new(Duration::from_secs(10), Duration::from_millis(1), Duration::from_secs(1)));
        let token_manager = Mutex::new(TokenManager::new(RoutingToken::new(NodeIdRange::FULL, 1), Duration::from_secs(5)));
        let transport = CountingTransport { sent: AtomicUsize::new(0) };

        handle_inbound_ping(&ring, &lease, &token_manager, &transport, sample_ping(sender, 5)).await;

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1, "advanced ticket should trigger a symmetric reply");
    }
}
