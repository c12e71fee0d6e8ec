//! A process-local stand-in for the real message transport (wire framing
//! is a Non-goal; see spec.md §4 and `contracts.rs`). Grounded on
//! `net/mock.rs`'s role as a dev/test substitute for the real networking
//! stack, reimplemented here as an in-process registry instead of a
//! WebSocket loopback, since this crate carries no wire-framing layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use ring_fabric::contracts::{MessageTransport, SendRequestError};
use ring_fabric::identifier::NodeId;
use ring_fabric::instance::NodeInstance;

pub struct MockTransport {
    addresses: DashMap<NodeId, String>,
    inboxes: DashMap<String, mpsc::Sender<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            addresses: DashMap::new(),
            inboxes: DashMap::new(),
        }
    }

    /// Register `node` as reachable at `address`, wiring up an inbox that
    /// drains into a caller-supplied channel.
    pub fn register(&self, node: NodeId, address: String) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(256);
        self.addresses.insert(node, address.clone());
        self.inboxes.insert(address, tx);
        rx
    }

    pub fn unregister(&self, node: NodeId) {
        if let Some((_, address)) = self.addresses.remove(&node) {
            self.inboxes.remove(&address);
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send(&self, _target: &NodeInstance, address: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        match self.inboxes.get(address) {
            Some(inbox) => inbox.send(payload).await.map_err(|e| anyhow::anyhow!("mock transport: {e}")),
            None => Err(anyhow::anyhow!("mock transport: no inbox registered at {address}")),
        }
    }

    /// This stand-in has no reply channel wired up (the binary it serves
    /// never re-enters the routing engine from an inbound listener), so a
    /// request round trip is reported as unsupported rather than faked.
    async fn send_request(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, SendRequestError> {
        Err(SendRequestError::Transport(anyhow::anyhow!("mock transport: request/reply not wired up")))
    }

    async fn resolve_address(&self, target: NodeId) -> Option<String> {
        self.addresses.get(&target).map(|v| v.clone())
    }
}
