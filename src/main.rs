use std::sync::Arc;

use ring_fabric::config::Config;
use ring_fabric::node::Node;
use ring_fabric::printout::Printout;
use ring_fabric::routing::EchoDispatch;

mod mock_transport;

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if let Err(e) = tokio::fs::create_dir_all(&config.home_directory).await {
        panic!("failed to create home directory: {:?}", e);
    }
    println!("ring-fabric: home at {}\r", config.home_directory);

    let transport: Arc<dyn ring_fabric::contracts::MessageTransport> = Arc::new(mock_transport::MockTransport::new());

    // No application layer is wired into this binary (spec.md §1 Non-goal:
    // application-level message schemas above routing); a locally-dispatched
    // request is simply echoed back.
    let (node, mut print_rx) = Node::open(config, transport.clone(), Arc::new(EchoDispatch))
        .await
        .expect("failed to open node");

    tokio::spawn(async move {
        while let Some(Printout { verbosity, content }) = print_rx.recv().await {
            if verbosity == 0 {
                println!("{}", content);
            } else {
                eprintln!("[v{}] {}", verbosity, content);
            }
        }
    });

    let background = node.spawn_background(transport);

    println!("ring-fabric: node {} routing on ring {}\r", node.this_node, node.config.ring_name);

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    println!("ring-fabric: shutting down\r");
    node.shutdown();
    for handle in background {
        let _ = handle.await;
    }
}
