//! Header-bag types carried on routing envelopes.
//!
//! Spec.md §9 calls out a header-bag message design (opaque payload plus a
//! strongly-typed header bag) instead of the original's single omnibus
//! message class; grounded here on `net/types.rs`'s small, independently
//! (de)serializable message-fragment structs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identifier::NodeIdRange;
use crate::instance::NodeInstance;
use crate::partner::Phase;

/// One remote node's self-reported state, as carried in a neighborhood
/// exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NeighborHeader {
    pub instance: NodeInstance,
    pub transport_address: Option<String>,
    pub phase: Phase,
    pub token_version: u64,
}

/// A sender's known neighborhood: the arc it claims to have complete
/// knowledge of, and every partner it knows within that arc.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NeighborListHeader {
    pub range: NodeIdRange,
    pub entries: Vec<NeighborHeader>,
}

/// Attached to routed messages so the receiver can update its view of the
/// sender without a separate round trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FromHeader {
    pub instance: NodeInstance,
    pub phase: Phase,
    pub token_version: u64,
}

/// Attached to a forwarded or routed message to record the path taken so
/// far, bounding retry loops and surfacing routing failures.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouteHeader {
    pub hop_count: u32,
    pub visited: Vec<NodeInstance>,
}

impl RouteHeader {
    pub fn record_hop(&mut self, hop: NodeInstance) {
        self.hop_count += 1;
        self.visited.push(hop);
    }

    pub fn has_visited(&self, node: &NodeInstance) -> bool {
        self.visited.iter().any(|v| v.id == node.id)
    }
}

/// Broadcast/multicast delivery metadata: the originating instance and a
/// monotone sequence number scoping de-duplication at each hop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MessageId {
    pub origin: NodeInstance,
    pub sequence: u64,
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// Global-time exchange attached to ping traffic (spec.md §6), in
/// lease-tick units: lets each side widen its peer's `GlobalTimeUpperLimit`
/// without a dedicated round trip.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GlobalTimeExchangeHeader {
    pub epoch: u64,
    pub send_time: Duration,
    pub sender_lower_limit: Duration,
    pub receiver_upper_limit: Duration,
}
