//! The kernel object: owns every manager by value and spawns the
//! background tasks (ping, holding-list re-evaluation). An arena-style
//! owner rather than a web of shared pointers, so ownership of the ring,
//! token, and routing state is never ambiguous.
//!
//! Grounded on `main.rs`'s top-level wiring (create home dir, build
//! channels, spawn tasks, hold `JoinHandle`s) adapted from "one process,
//! many runtime modules" to "one node, several owned managers."

use std::sync::Arc;

use rand::{RngCore, SeedableRng};
use tokio::sync::{watch, Mutex};

use crate::broadcast::BroadcastEngine;
use crate::config::Config;
use crate::contracts::{Arbitrator, LeaseAgent, MessageTransport};
use crate::error::Result;
use crate::identifier::NodeId;
use crate::instance::NodeInstance;
use crate::join::JoinState;
use crate::lease::LeaseContext;
use crate::persistence::next_instance_id;
use crate::printout::{print, print_channel, PrintReceiver, PrintSender};
use crate::ring::Ring;
use crate::routing::{ApplicationDispatch, RoutingEngine};
use crate::token::RoutingToken;
use crate::token_manager::TokenManager;

pub struct Node {
    pub config: Config,
    pub this_node: NodeInstance,
    pub ring: Arc<Mutex<Ring>>,
    pub token_manager: Arc<Mutex<TokenManager>>,
    pub routing: Arc<RoutingEngine>,
    pub broadcast: Arc<BroadcastEngine>,
    pub join: Arc<Mutex<JoinState>>,
    pub lease: Arc<Mutex<LeaseContext>>,
    pub print_tx: PrintSender,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Open a node: derive or load its identity, advance the persisted
    /// instance counter, and wire every manager together. Does not start
    /// the join state machine or background loops — call `spawn_background`
    /// separately so tests can construct a `Node` without side effects.
    pub async fn open(config: Config, transport: Arc<dyn MessageTransport>, dispatcher: Arc<dyn ApplicationDispatch>) -> Result<(Self, PrintReceiver)> {
        let id = derive_node_id(&config.listen_address, &config.ring_name);
        let instance_id = next_instance_id(std::path::Path::new(&config.home_directory)).await?;
        let this_node = NodeInstance::new(id, instance_id);

        let (print_tx, print_rx) = print_channel(256);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let ring = Arc::new(Mutex::new(Ring::new(this_node, config.ring_name.clone(), config.hood_size)));
        let token_manager = Arc::new(Mutex::new(TokenManager::new(RoutingToken::default(), config.holding_timeout)));
        let routing = Arc::new(RoutingEngine::new(
            ring.clone(),
            transport.clone(),
            dispatcher,
            config.routing_retry_count,
            config.routing_retry_interval,
        ));
        let broadcast = Arc::new(BroadcastEngine::new(ring.clone(), config.broadcast_fanout));
        let join = Arc::new(Mutex::new(JoinState::new(this_node)));
        let lease = Arc::new(Mutex::new(LeaseContext::new(
            config.unknown_timeout,
            config.ping_interval * 3,
            config.unknown_timeout * 2,
        )));

        print(&print_tx, 0, format!("node: opened as {}", this_node)).await;

        Ok((
            Node {
                config,
                this_node,
                ring,
                token_manager,
                routing,
                broadcast,
                join,
                lease,
                print_tx,
                shutdown_tx,
            },
            print_rx,
        ))
    }

    /// Spawn the background tasks (ping loop). Returns their join handles
    /// so callers can await clean shutdown.
    pub fn spawn_background(&self, transport: Arc<dyn MessageTransport>) -> Vec<tokio::task::JoinHandle<()>> {
        let ping_handle = tokio::spawn(crate::ping::run_ping_loop(
            self.ring.clone(),
            self.token_manager.clone(),
            transport,
            self.print_tx.clone(),
            self.config.ping_interval,
            self.shutdown_tx.subscribe(),
        ));
        vec![ping_handle]
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn bootstrap_join(&self, required_count: usize) {
        let ring = self.ring.lock().await;
        self.join.lock().await.on_neighborhood_query_reply(&ring, required_count);
    }

    /// Establish leases with the immediate predecessor and successor once
    /// they are known, completing the implicit lease context (spec.md
    /// §4.8).
    pub async fn establish_implicit_leases(&self, lease_agent: &dyn LeaseAgent, lease_duration: std::time::Duration) -> anyhow::Result<()> {
        let (pred, succ) = {
            let ring = self.ring.lock().await;
            let (_, members) = ring.get_hood();
            let me = ring.this_node().id;
            let pred = members.iter().filter(|m| m.id.0 < me.0).max_by_key(|m| m.id.0).copied();
            let succ = members.iter().filter(|m| m.id.0 > me.0).min_by_key(|m| m.id.0).copied();
            (pred, succ)
        };
        let mut lease = self.lease.lock().await;
        if let Some(pred) = pred {
            lease_agent.establish(pred.id, "").await?;
            lease.predecessor.set_partner(pred, lease_duration);
        }
        if let Some(succ) = succ {
            lease_agent.establish(succ.id, "").await?;
            lease.successor.set_partner(succ, lease_duration);
        }
        Ok(())
    }

    /// Run one arbitration pass for both lease sides, demoting a neighbor
    /// to `Shutdown` on rejection.
    pub async fn run_arbitration_pass(&self, arbitrator: &dyn Arbitrator) {
        let mut lease = self.lease.lock().await;
        if lease.predecessor.needs_arbitration() {
            if let Some(partner) = lease.predecessor.partner() {
                if let Ok(outcome) = lease.predecessor.arbitrate(arbitrator, self.this_node.id, self.this_node.instance_id, partner.instance_id).await {
                    if matches!(outcome, crate::lease::ArbitrationOutcome::Rejected) {
                        self.ring.lock().await.set_shutdown(partner.id);
                        lease.mark_demotion();
                    }
                }
            }
        }
        if lease.successor.needs_arbitration() {
            if let Some(partner) = lease.successor.partner() {
                if let Ok(outcome) = lease.successor.arbitrate(arbitrator, self.this_node.id, self.this_node.instance_id, partner.instance_id).await {
                    if matches!(outcome, crate::lease::ArbitrationOutcome::Rejected) {
                        self.ring.lock().await.set_shutdown(partner.id);
                        lease.mark_demotion();
                    }
                }
            }
        }
    }
}

/// Derive a ring identifier from the listen address and ring name. A real
/// deployment would key this off a stable on-disk identity; this crate has
/// no PKI layer (a spec.md Non-goal), so the id is randomly drawn at first
/// open and then persisted implicitly via the instance counter file living
/// alongside it under the same home directory.
fn derive_node_id(listen_address: &str, ring_name: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    listen_address.hash(&mut hasher);
    ring_name.hash(&mut hasher);
    let seed = hasher.finish();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    NodeId::new(u128::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::routing::EchoDispatch;

    struct NullTransport;

    #[async_trait]
    impl MessageTransport for NullTransport {
        async fn send(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_request(
            &self,
            _target: &NodeInstance,
            _address: &str,
            payload: Vec<u8>,
            _timeout: std::time::Duration,
        ) -> Result<Vec<u8>, crate::contracts::SendRequestError> {
            Ok(payload)
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn open_derives_stable_id_for_same_address_and_ring() {
        let dir = std::env::temp_dir().join(format!("ring-fabric-node-test-{}", rand::random::<u64>()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let config = Config::for_test("ring-a", dir.to_str().unwrap());
        let (node, _rx) = Node::open(config.clone(), Arc::new(NullTransport), Arc::new(EchoDispatch)).await.unwrap();
        let (node2, _rx2) = Node::open(config, Arc::new(NullTransport), Arc::new(EchoDispatch)).await.unwrap();
        assert_eq!(node.this_node.id, node2.this_node.id);
        assert_ne!(node.this_node.instance_id, node2.this_node.instance_id);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
