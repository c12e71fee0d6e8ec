//! PartnerNode: everything the local node knows about one remote node.
//!
//! Grounded on `net/types.rs::Peer`/`Identity`/`IdentityExt` for the field
//! list (identity, transport target, liveness bookkeeping) and on
//! `original_source/src/prod/src/Federation/PartnerNode.cpp` for the phase lifecycle and
//! the `Consider`/`SetUnknown`/`SetShutdown` transition names.

use crate::identifier::NodeId;
use crate::instance::NodeInstance;
use crate::token::RoutingToken;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A partner's position in the join/routing lifecycle. Monotone forward
/// except for an explicit restart, which resets a *new* `PartnerNode`
/// (never rewinds an existing one) back to `Booting`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    Booting,
    Joining,
    Inserting,
    Routing,
    Shutdown,
}

impl Phase {
    pub fn is_routing(&self) -> bool {
        matches!(self, Phase::Routing)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Phase::Shutdown)
    }
}

/// Upper bound on the peer's global clock, widened linearly with real time
/// at a configured drift ratio when no fresher ping has refreshed it.
#[derive(Clone, Copy, Debug)]
pub struct GlobalTimeUpperLimit {
    limit_at_refresh: Duration,
    refreshed_at: Instant,
    drift_ratio: f64,
}

impl GlobalTimeUpperLimit {
    pub fn new(initial: Duration, drift_ratio: f64) -> Self {
        GlobalTimeUpperLimit {
            limit_at_refresh: initial,
            refreshed_at: Instant::now(),
            drift_ratio,
        }
    }

    pub fn refresh(&mut self, new_limit: Duration) {
        self.limit_at_refresh = new_limit;
        self.refreshed_at = Instant::now();
    }

    /// The current upper bound: the last-observed limit, widened by
    /// `drift_ratio` for every second of real time elapsed since.
    pub fn current(&self) -> Duration {
        let elapsed = self.refreshed_at.elapsed();
        let drift = elapsed.mul_f64(self.drift_ratio);
        self.limit_at_refresh + drift
    }
}

/// Per-remote-node record, owned by this node's ring.
#[derive(Clone, Debug)]
pub struct PartnerNode {
    pub instance: NodeInstance,
    pub ring_name: String,
    pub transport_address: Option<String>,
    pub lease_agent_address: Option<String>,
    pub lease_agent_instance: u64,
    pub phase: Phase,
    pub token: RoutingToken,
    /// After this instant, if no reply has been observed, treat the peer
    /// as unknown (a soft liveness failure, distinct from `Shutdown`).
    pub unknown_start: Option<Instant>,
    /// When this node should next be pinged to confirm liveness.
    pub next_liveness_update: Instant,
    pub global_time_upper_limit: GlobalTimeUpperLimit,
    pub last_access: Instant,
    pub last_consider: Instant,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PartnerHeader {
    pub instance: NodeInstance,
    pub ring_name: String,
    pub transport_address: Option<String>,
    pub lease_agent_address: Option<String>,
    pub lease_agent_instance: u64,
    pub phase: Phase,
    pub token_version: u64,
}

impl Serialize for Phase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let tag = match self {
            Phase::Booting => 0u8,
            Phase::Joining => 1,
            Phase::Inserting => 2,
            Phase::Routing => 3,
            Phase::Shutdown => 4,
        };
        tag.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = u8::deserialize(deserializer)?;
        Ok(match tag {
            0 => Phase::Booting,
            1 => Phase::Joining,
            2 => Phase::Inserting,
            3 => Phase::Routing,
            _ => Phase::Shutdown,
        })
    }
}

impl PartnerNode {
    pub fn new(instance: NodeInstance, ring_name: String, transport_address: Option<String>) -> Self {
        let now = Instant::now();
        PartnerNode {
            instance,
            ring_name,
            transport_address,
            lease_agent_address: None,
            lease_agent_instance: 0,
            phase: Phase::Booting,
            token: RoutingToken::default(),
            unknown_start: None,
            next_liveness_update: now,
            global_time_upper_limit: GlobalTimeUpperLimit::new(Duration::ZERO, 0.0),
            last_access: now,
            last_consider: now,
        }
    }

    pub fn id(&self) -> NodeId {
        self.instance.id
    }

    pub fn touch_access(&mut self) {
        self.last_access = Instant::now();
    }

    /// Idempotent upsert from a received header. Returns `false` (no
    /// mutation applied) if `header` carries a stale instance — the sole
    /// linearization point for node identity (spec.md §5).
    pub fn consider(&mut self, header: &PartnerHeader) -> bool {
        if header.instance.id != self.instance.id {
            return false;
        }
        if header.instance.instance_id < self.instance.instance_id {
            // strictly older instance: drop as stale
            return false;
        }
        self.instance = header.instance;
        self.transport_address = header.transport_address.clone();
        self.lease_agent_address = header.lease_agent_address.clone();
        self.lease_agent_instance = header.lease_agent_instance;
        if !matches!(self.phase, Phase::Shutdown) {
            self.phase = header.phase;
        }
        self.last_consider = Instant::now();
        true
    }

    /// Soft liveness failure: the peer did not answer a probe within the
    /// expected window. Does not release token linkage or drop it from the
    /// neighborhood.
    pub fn set_unknown(&mut self) {
        if self.unknown_start.is_none() {
            self.unknown_start = Some(Instant::now());
        }
    }

    pub fn clear_unknown(&mut self) {
        self.unknown_start = None;
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown_start.is_some()
    }

    /// Hard failure: an explicit `NodeDoesNotMatchFault`-equivalent reply
    /// was observed. Terminal — releases the transport target and drops
    /// the partner from neighborhood/token linkage.
    pub fn set_shutdown(&mut self) {
        self.phase = Phase::Shutdown;
        self.transport_address = None;
    }

    pub fn header(&self) -> PartnerHeader {
        PartnerHeader {
            instance: self.instance,
            ring_name: self.ring_name.clone(),
            transport_address: self.transport_address.clone(),
            lease_agent_address: self.lease_agent_address.clone(),
            lease_agent_instance: self.lease_agent_instance,
            phase: self.phase,
            token_version: self.token.version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: u128, n: u64) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), n)
    }

    #[test]
    fn consider_drops_stale_instance() {
        let mut partner = PartnerNode::new(instance(1, 5), "ring".into(), None);
        partner.phase = Phase::Routing;
        let stale = PartnerHeader {
            instance: instance(1, 3),
            ring_name: "ring".into(),
            transport_address: Some("stale".into()),
            lease_agent_address: None,
            lease_agent_instance: 0,
            phase: Phase::Joining,
            token_version: 0,
        };
        assert!(!partner.consider(&stale));
        assert_eq!(partner.instance.instance_id, 5);
        assert!(matches!(partner.phase, Phase::Routing));
    }

    #[test]
    fn consider_applies_newer_instance() {
        let mut partner = PartnerNode::new(instance(1, 5), "ring".into(), None);
        let fresh = PartnerHeader {
            instance: instance(1, 6),
            ring_name: "ring".into(),
            transport_address: Some("fresh".into()),
            lease_agent_address: None,
            lease_agent_instance: 0,
            phase: Phase::Routing,
            token_version: 0,
        };
        assert!(partner.consider(&fresh));
        assert_eq!(partner.instance.instance_id, 6);
        assert!(matches!(partner.phase, Phase::Routing));
    }

    #[test]
    fn shutdown_is_terminal_and_releases_target() {
        let mut partner = PartnerNode::new(instance(1, 1), "ring".into(), Some("addr".into()));
        partner.set_shutdown();
        assert!(partner.phase.is_shutdown());
        assert!(partner.transport_address.is_none());

        let header = PartnerHeader {
            instance: instance(1, 2),
            ring_name: "ring".into(),
            transport_address: Some("addr2".into()),
            lease_agent_address: None,
            lease_agent_instance: 0,
            phase: Phase::Routing,
            token_version: 0,
        };
        partner.consider(&header);
        assert!(partner.phase.is_shutdown(), "shutdown phase must stick");
    }
}
