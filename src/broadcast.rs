//! Broadcast engine: deliver a message once to every node in a contiguous
//! range of the ring (spec.md §4.5).
//!
//! Grounded on `original_source/src/prod/src/Federation/BroadcastForwardContext.h`/`.cpp`
//! for the context's field list and completion rule (pending sub-ranges,
//! upstream-ack bookkeeping), adapted to the ownership/async idioms used by
//! `src/routing.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::headers::MessageId;
use crate::identifier::{NodeId, NodeIdRange};
use crate::instance::NodeInstance;
use crate::ring::Ring;

/// Loop-defense counter carried on every forwarded hop.
#[derive(Clone, Copy, Debug, Default)]
pub struct BroadcastStepHeader {
    pub hop_count: u32,
}

/// Tracks pending sub-ranges for one in-flight broadcast at this hop.
/// Completes (fires `on_complete`, if present) once every sub-range has
/// acked and, if there is one, the upstream has been informed.
pub struct BroadcastForwardContext {
    pub id: MessageId,
    pending: HashMap<NodeId, NodeIdRange>,
    upstream_informed: bool,
    on_complete: Option<oneshot::Sender<()>>,
}

impl BroadcastForwardContext {
    pub fn new(id: MessageId, sub_ranges: Vec<(NodeId, NodeIdRange)>, on_complete: Option<oneshot::Sender<()>>) -> Self {
        BroadcastForwardContext {
            id,
            pending: sub_ranges.into_iter().collect(),
            upstream_informed: false,
            on_complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Mark the sub-range forwarded to `hop` as acked. Returns `true` if
    /// this was the completing ack.
    pub fn ack(&mut self, hop: NodeId) -> bool {
        self.pending.remove(&hop);
        if self.pending.is_empty() {
            if let Some(tx) = self.on_complete.take() {
                let _ = tx.send(());
            }
            true
        } else {
            false
        }
    }

    pub fn mark_upstream_informed(&mut self) {
        self.upstream_informed = true;
    }

    pub fn upstream_informed(&self) -> bool {
        self.upstream_informed
    }
}

pub struct BroadcastEngine {
    ring: Arc<Mutex<Ring>>,
    fanout: usize,
    contexts: Mutex<HashMap<u64, BroadcastForwardContext>>,
}

impl BroadcastEngine {
    pub fn new(ring: Arc<Mutex<Ring>>, fanout: usize) -> Self {
        BroadcastEngine {
            ring,
            fanout,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Per-hop algorithm (spec.md §4.5):
    /// 1. compute the local neighborhood range and subtract it from the
    ///    requested range, yielding sub-ranges still needing forwarding;
    /// 2. for each sub-range pick the node closest to its median;
    /// 3. dispatch locally within the intersection once.
    pub async fn plan_hop(&self, range: NodeIdRange) -> (NodeIdRange, Vec<(NodeInstance, NodeIdRange)>) {
        let ring = self.ring.lock().await;
        let (local_range, _) = ring.get_hood();
        let to_forward = range.subtract(&[local_range]);
        let local_dispatch = if local_range.is_full() {
            range
        } else {
            intersect(&range, &local_range)
        };

        let mut forwards = Vec::new();
        for sub in to_forward.into_iter().take(self.fanout) {
            let median = median_of(&sub);
            if let Some(target) = ring.find_closest(median) {
                forwards.push((target, sub));
            }
        }
        (local_dispatch, forwards)
    }

    pub async fn register_context(&self, ctx: BroadcastForwardContext) {
        self.contexts.lock().await.insert(hop_key(ctx.id), ctx);
    }

    /// Record a downstream ack for `hop`'s sub-range; returns `true` if the
    /// context this completes has now finished.
    pub async fn ack(&self, id: MessageId, hop: NodeId) -> bool {
        let mut contexts = self.contexts.lock().await;
        match contexts.get_mut(&hop_key(id)) {
            Some(ctx) => {
                let completed = ctx.ack(hop);
                if completed {
                    contexts.remove(&hop_key(id));
                }
                completed
            }
            None => false,
        }
    }

    pub async fn is_pending(&self, id: MessageId) -> bool {
        self.contexts.lock().await.contains_key(&hop_key(id))
    }
}

fn hop_key(id: MessageId) -> u64 {
    id.origin.instance_id ^ id.sequence
}

fn median_of(range: &NodeIdRange) -> NodeId {
    let span = range.begin().succ_dist(range.end());
    NodeId::new(range.begin().0.wrapping_add(span / 2))
}

fn intersect(a: &NodeIdRange, b: &NodeIdRange) -> NodeIdRange {
    if b.contains(a.begin()) && b.contains(a.end()) {
        *a
    } else if a.contains(b.begin()) && a.contains(b.end()) {
        *b
    } else if b.contains(a.begin()) {
        NodeIdRange::new(a.begin(), b.end())
    } else if b.contains(a.end()) {
        NodeIdRange::new(b.begin(), a.end())
    } else {
        NodeIdRange::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::NodeInstance;

    fn inst(id: u128) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), 1)
    }

    #[tokio::test]
    async fn plan_hop_splits_range_outside_local_hood() {
        let mut ring = Ring::new(inst(0), "ring".into(), 2);
        ring.upsert(crate::partner::PartnerNode::new(inst(50), "ring".into(), Some("a1".into())));
        let mut p = crate::partner::PartnerNode::new(inst(50), "ring".into(), Some("a1".into()));
        p.phase = crate::partner::Phase::Routing;
        ring.upsert(p);

        let engine = BroadcastEngine::new(Arc::new(Mutex::new(ring)), 4);
        let (_local, forwards) = engine.plan_hop(NodeIdRange::FULL).await;
        // with no established hood edges the local range defaults to a
        // point at `this_node`, so nearly all of FULL should be forwarded
        assert!(!forwards.is_empty());
    }

    #[test]
    fn context_completes_once_all_subranges_ack() {
        let (tx, mut rx) = oneshot::channel();
        let mut ctx = BroadcastForwardContext::new(
            MessageId { origin: inst(0), sequence: 1 },
            vec![
                (NodeId::new(1), NodeIdRange::new(NodeId::new(1), NodeId::new(10))),
                (NodeId::new(2), NodeIdRange::new(NodeId::new(11), NodeId::new(20))),
            ],
            Some(tx),
        );
        assert!(!ctx.ack(NodeId::new(1)));
        assert!(ctx.ack(NodeId::new(2)));
        assert!(ctx.is_complete());
        assert!(rx.try_recv().is_ok());
    }
}
