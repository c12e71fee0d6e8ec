//! Routing engine: hop-by-hop forwarding with retries, a holding list for
//! messages that cannot currently make progress, and an idempotency set
//! for retried duplicates (spec.md §4.4).
//!
//! Grounded on `net/mod.rs::networking()`'s async hop/retry loop (resolve
//! target, send, await reply-or-timeout, retry on transient fault) for the
//! Rust shape, and on spec.md §4.4 directly for the federation-specific
//! retry/holding semantics (no surviving `RoutingManager.cpp` body past
//! the `original_source` filter).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::contracts::{MessageTransport, RemoteRoutingFault, SendRequestError};
use crate::headers::{MessageId, RouteHeader};
use crate::identifier::NodeId;
use crate::instance::NodeInstance;
use crate::ring::Ring;

/// Hands a locally-owned request payload to the application layer and
/// returns its reply (spec.md §4.4(2): "dispatch to the application
/// actor"). The application-level message schema above routing is out of
/// scope (spec.md §1 Non-goals); this trait is the seam a real application
/// wires a handler into.
#[async_trait]
pub trait ApplicationDispatch: Send + Sync {
    async fn dispatch(&self, payload: Vec<u8>) -> Vec<u8>;
}

/// Stand-in dispatcher that echoes the request back as the reply, used
/// where no application layer has been wired in yet.
pub struct EchoDispatch;

#[async_trait]
impl ApplicationDispatch for EchoDispatch {
    async fn dispatch(&self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RoutingFault {
    #[error("timeout")]
    Timeout,
    #[error("routing node does not match fault")]
    RoutingNodeDoesNotMatch,
    #[error("node is not routing fault")]
    NodeIsNotRouting,
    #[error("p2p node does not match fault")]
    P2PNodeDoesNotMatch,
    #[error("operation failed: no routing partner available")]
    OperationFailed,
    #[error("incompatible version")]
    IncompatibleVersion,
    #[error("cancelled")]
    Cancelled,
}

impl RoutingFault {
    /// `Timeout` is retryable only for messages marked idempotent by the
    /// routing layer on initial entry; `NodeIsNotRouting` and
    /// `P2PNodeDoesNotMatch` are always retryable; everything else is
    /// terminal.
    fn retryable(&self, idempotent: bool) -> bool {
        match self {
            RoutingFault::Timeout => idempotent,
            RoutingFault::NodeIsNotRouting | RoutingFault::P2PNodeDoesNotMatch => true,
            _ => false,
        }
    }
}

struct HeldContext {
    dest: NodeId,
    dest_instance: Option<NodeInstance>,
    exact_match: bool,
    payload: Vec<u8>,
    route_header: RouteHeader,
}

pub struct RoutingEngine {
    ring: Arc<Mutex<Ring>>,
    transport: Arc<dyn MessageTransport>,
    dispatcher: Arc<dyn ApplicationDispatch>,
    retry_count: u32,
    retry_interval: Duration,
    idempotency_set: Mutex<HashSet<u64>>,
    holding_list: Mutex<HashMap<u64, HeldContext>>,
}

impl RoutingEngine {
    pub fn new(
        ring: Arc<Mutex<Ring>>,
        transport: Arc<dyn MessageTransport>,
        dispatcher: Arc<dyn ApplicationDispatch>,
        retry_count: u32,
        retry_interval: Duration,
    ) -> Self {
        RoutingEngine {
            ring,
            transport,
            dispatcher,
            retry_count,
            retry_interval,
            idempotency_set: Mutex::new(HashSet::new()),
            holding_list: Mutex::new(HashMap::new()),
        }
    }

    /// `Route`: fire-and-forget delivery; completes on next-hop
    /// acknowledgement only.
    pub async fn route(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        dest: NodeId,
        dest_instance: Option<NodeInstance>,
        exact_match: bool,
        idempotent: bool,
        overall_timeout: Duration,
    ) -> Result<(), RoutingFault> {
        let key = hop_key(message_id);
        {
            let mut set = self.idempotency_set.lock().await;
            if !set.insert(key) {
                return Ok(());
            }
        }
        let result = self.drive(payload, dest, dest_instance, exact_match, idempotent, overall_timeout).await;
        self.idempotency_set.lock().await.remove(&key);
        result.map(|_| ())
    }

    /// `RouteRequest`: end-to-end RPC; returns the reply payload collected
    /// from the dispatching node.
    pub async fn route_request(
        &self,
        message_id: MessageId,
        payload: Vec<u8>,
        dest: NodeId,
        dest_instance: Option<NodeInstance>,
        exact_match: bool,
        idempotent: bool,
        overall_timeout: Duration,
    ) -> Result<Vec<u8>, RoutingFault> {
        let key = hop_key(message_id);
        {
            let mut set = self.idempotency_set.lock().await;
            if !set.insert(key) {
                return Err(RoutingFault::Cancelled);
            }
        }
        let result = self.drive(payload, dest, dest_instance, exact_match, idempotent, overall_timeout).await;
        self.idempotency_set.lock().await.remove(&key);
        result
    }

    async fn drive(
        &self,
        payload: Vec<u8>,
        dest: NodeId,
        dest_instance: Option<NodeInstance>,
        exact_match: bool,
        idempotent: bool,
        overall_timeout: Duration,
    ) -> Result<Vec<u8>, RoutingFault> {
        let mut retry_count: u32 = 0;
        let mut header = RouteHeader::default();
        loop {
            let safe_mode = retry_count >= 3;
            let (closest, owns_token, this_id) = {
                let ring = self.ring.lock().await;
                let (closest, owns_token) = ring.get_routing_hop(dest, safe_mode);
                (closest, owns_token, ring.this_node().id)
            };
            let closest = match closest {
                Some(c) => c,
                None => return Err(RoutingFault::OperationFailed),
            };

            if owns_token && closest.id == this_id {
                if exact_match {
                    if let Some(expected) = dest_instance {
                        if expected.instance_id != closest.instance_id {
                            return Err(RoutingFault::RoutingNodeDoesNotMatch);
                        }
                    }
                }
                return Ok(self.dispatcher.dispatch(payload).await);
            }

            if header.has_visited(&closest) && retry_count >= self.retry_count {
                return Err(RoutingFault::OperationFailed);
            }
            header.record_hop(closest);

            let per_hop_timeout = self.retry_interval.min(overall_timeout);
            let outcome = timeout(per_hop_timeout, self.send_hop(&closest, &payload, per_hop_timeout)).await;

            match outcome {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(fault)) => {
                    retry_count += 1;
                    if !fault.retryable(idempotent) || retry_count > self.retry_count {
                        return Err(fault);
                    }
                }
                Err(_elapsed) => {
                    retry_count += 1;
                    if !RoutingFault::Timeout.retryable(idempotent) || retry_count > self.retry_count {
                        return Err(RoutingFault::Timeout);
                    }
                }
            }
        }
    }

    /// Drives a single hop with a real request/reply round trip (spec.md
    /// §6's `SendRequest`), relaying whatever the destination actually
    /// returns rather than echoing the outbound payload.
    async fn send_hop(&self, target: &NodeInstance, payload: &[u8], hop_timeout: Duration) -> Result<Vec<u8>, RoutingFault> {
        let address = self
            .transport
            .resolve_address(target.id)
            .await
            .ok_or(RoutingFault::NodeIsNotRouting)?;
        match self.transport.send_request(target, &address, payload.to_vec(), hop_timeout).await {
            Ok(reply) => Ok(reply),
            Err(SendRequestError::Remote(RemoteRoutingFault::RoutingNodeDoesNotMatch)) => Err(RoutingFault::RoutingNodeDoesNotMatch),
            Err(SendRequestError::Remote(RemoteRoutingFault::NodeIsNotRouting)) => Err(RoutingFault::NodeIsNotRouting),
            Err(SendRequestError::Remote(RemoteRoutingFault::P2PNodeDoesNotMatch)) => Err(RoutingFault::P2PNodeDoesNotMatch),
            Err(SendRequestError::Transport(_)) => Err(RoutingFault::Timeout),
        }
    }

    /// Park a context that could not make progress (no closest hop, or
    /// closest is self without token ownership).
    pub async fn hold(&self, message_id: MessageId, dest: NodeId, dest_instance: Option<NodeInstance>, exact_match: bool, payload: Vec<u8>) {
        self.holding_list.lock().await.insert(
            hop_key(message_id),
            HeldContext {
                dest,
                dest_instance,
                exact_match,
                payload,
                route_header: RouteHeader::default(),
            },
        );
    }

    /// Re-evaluate every held context on a neighborhood-change or
    /// token-change event. Contexts whose target has since gone `Shutdown`
    /// are simply dropped by the caller failing to resolve a hop; here we
    /// just report which ids are ready so the caller can re-drive them.
    pub async fn reevaluate_holding(&self) -> Vec<(u64, NodeId, Option<NodeInstance>, bool, Vec<u8>)> {
        let held = self.holding_list.lock().await;
        held.iter()
            .map(|(id, ctx)| (*id, ctx.dest, ctx.dest_instance, ctx.exact_match, ctx.payload.clone()))
            .collect()
    }

    pub async fn release_held(&self, message_id: u64) {
        self.holding_list.lock().await.remove(&message_id);
    }
}

fn hop_key(message_id: MessageId) -> u64 {
    message_id.origin.instance_id ^ message_id.sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::NodeIdRange;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct EchoTransport;

    #[async_trait]
    impl MessageTransport for EchoTransport {
        async fn send(&self, _target: &NodeInstance, _address: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            let _ = payload;
            Ok(())
        }

        async fn send_request(&self, _target: &NodeInstance, _address: &str, payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, SendRequestError> {
            Ok(payload)
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            Some("mock".into())
        }
    }

    fn inst(id: u128) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), 1)
    }

    fn engine(ring: Ring) -> RoutingEngine {
        RoutingEngine::new(
            Arc::new(TokioMutex::new(ring)),
            Arc::new(EchoTransport),
            Arc::new(EchoDispatch),
            3,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn route_dispatches_locally_when_self_owns_token() {
        let mut ring = Ring::new(inst(0), "ring".into(), 2);
        ring.set_my_token_range(NodeIdRange::FULL);
        let engine = engine(ring);
        let result = engine
            .route_request(
                MessageId { origin: inst(0), sequence: 1 },
                b"hello".to_vec(),
                NodeId::new(5),
                None,
                false,
                true,
                Duration::from_millis(500),
            )
            .await
            .unwrap();
        assert_eq!(result, b"hello");
    }

    #[tokio::test]
    async fn duplicate_message_id_is_idempotent() {
        let mut ring = Ring::new(inst(0), "ring".into(), 2);
        ring.set_my_token_range(NodeIdRange::FULL);
        let engine = engine(ring);
        let id = MessageId { origin: inst(0), sequence: 7 };

        let first = engine.route(id, b"a".to_vec(), NodeId::new(1), None, false, true, Duration::from_millis(500));
        let second = engine.route(id, b"a".to_vec(), NodeId::new(1), None, false, true, Duration::from_millis(500));
        let (r1, r2) = tokio::join!(first, second);
        assert!(r1.is_ok());
        assert!(r2.is_ok());
    }

    #[tokio::test]
    async fn holding_list_tracks_and_releases_contexts() {
        let ring = Ring::new(inst(0), "ring".into(), 2);
        let engine = engine(ring);
        let id = MessageId { origin: inst(0), sequence: 3 };
        engine.hold(id, NodeId::new(9), None, false, b"held".to_vec()).await;
        let held = engine.reevaluate_holding().await;
        assert_eq!(held.len(), 1);
        engine.release_held(hop_key(id)).await;
        assert!(engine.reevaluate_holding().await.is_empty());
    }

    struct SlowTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for SlowTransport {
        async fn send(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_request(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, SendRequestError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![])
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            Some("remote".into())
        }
    }

    #[tokio::test]
    async fn non_idempotent_timeout_is_not_retried() {
        let mut ring = Ring::new(inst(0), "ring".into(), 2);
        let mut remote = crate::partner::PartnerNode::new(inst(100), "ring".into(), Some("remote".into()));
        remote.phase = crate::partner::Phase::Routing;
        ring.upsert(remote);
        let transport = Arc::new(SlowTransport { attempts: AtomicUsize::new(0) });
        let engine = RoutingEngine::new(Arc::new(TokioMutex::new(ring)), transport.clone(), Arc::new(EchoDispatch), 3, Duration::from_millis(20));
        let id = MessageId { origin: inst(0), sequence: 1 };
        let err = engine
            .route_request(id, b"x".to_vec(), NodeId::new(100), None, false, false, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, RoutingFault::Timeout);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    struct RemoteReplyTransport;

    #[async_trait]
    impl MessageTransport for RemoteReplyTransport {
        async fn send(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_request(&self, _target: &NodeInstance, _address: &str, _payload: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, SendRequestError> {
            Ok(b"reply-from-remote".to_vec())
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            Some("remote".into())
        }
    }

    #[tokio::test]
    async fn route_request_relays_the_remote_hops_reply_not_the_request() {
        let mut ring = Ring::new(inst(0), "ring".into(), 2);
        let mut remote = crate::partner::PartnerNode::new(inst(100), "ring".into(), Some("remote".into()));
        remote.phase = crate::partner::Phase::Routing;
        ring.upsert(remote);
        let engine = RoutingEngine::new(
            Arc::new(TokioMutex::new(ring)),
            Arc::new(RemoteReplyTransport),
            Arc::new(EchoDispatch),
            3,
            Duration::from_millis(50),
        );
        let id = MessageId { origin: inst(0), sequence: 1 };
        let reply = engine
            .route_request(id, b"request-body".to_vec(), NodeId::new(100), None, false, true, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, b"reply-from-remote");
    }
}
