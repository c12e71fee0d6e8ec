//! NodeInstance: a node identity paired with a restart-monotone counter.

use crate::identifier::NodeId;
use serde::{Deserialize, Serialize};

/// `(Id, InstanceId)`. `InstanceId` is drawn at open from a persisted
/// counter so that restarts of the same `NodeId` always produce a strictly
/// larger instance than any previous incarnation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeId,
    pub instance_id: u64,
}

impl NodeInstance {
    pub fn new(id: NodeId, instance_id: u64) -> Self {
        NodeInstance { id, instance_id }
    }

    /// Whether `candidate` could legitimately replace `self` as the record
    /// for this `NodeId` — i.e. it is a later incarnation, never an older
    /// or equal one. `PartnerNode::consider` uses this as its sole
    /// linearization point for node identity (spec.md §5).
    pub fn is_superseded_by(&self, candidate: NodeInstance) -> bool {
        debug_assert_eq!(self.id, candidate.id);
        candidate.instance_id > self.instance_id
    }
}

impl std::fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_strictly_greater_instances_supersede() {
        let id = NodeId::new(7);
        let current = NodeInstance::new(id, 5);
        assert!(current.is_superseded_by(NodeInstance::new(id, 6)));
        assert!(!current.is_superseded_by(NodeInstance::new(id, 5)));
        assert!(!current.is_superseded_by(NodeInstance::new(id, 4)));
    }
}
