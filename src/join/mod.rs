//! Join state machine: bring a new node from `Booting` into `Routing`
//! while preserving token uniqueness and neighborhood invariants
//! (spec.md §4.3).
//!
//! Grounded on `register.rs`'s overall shape (drive an external handshake
//! through named phases, restart on failure) for the Rust idiom, and
//! directly on spec.md's phase table for the phases themselves — no
//! surviving `JoinManager.cpp`/`JoinLockManager.cpp` implementation in
//! `original_source` beyond index references cut by the filter.

pub mod lock_manager;

use std::time::Instant;

use crate::contracts::{LeaseAgent, MessageTransport};
use crate::error::{FederationError, Result};
use crate::identifier::NodeIdRange;
use crate::instance::NodeInstance;
use crate::partner::Phase;
use crate::ring::Ring;

pub use lock_manager::{JoinLockManager, JoinThrottleHeader};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinPhase {
    QueryingNeighborhood,
    Locking,
    EstablishingLease,
    UnLocking,
    Routing,
}

pub struct JoinState {
    this_node: NodeInstance,
    phase: JoinPhase,
    extended_neighborhood: Vec<NodeInstance>,
    neighborhood_range: Option<NodeIdRange>,
    locks_held: Vec<NodeInstance>,
    leases_established: Vec<NodeInstance>,
    throttled_until: Option<Instant>,
}

impl JoinState {
    pub fn new(this_node: NodeInstance) -> Self {
        JoinState {
            this_node,
            phase: JoinPhase::QueryingNeighborhood,
            extended_neighborhood: Vec::new(),
            neighborhood_range: None,
            locks_held: Vec::new(),
            leases_established: Vec::new(),
            throttled_until: None,
        }
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    /// Restart: bump `InstanceId` (caller supplies the freshly persisted
    /// instance), reset to `QueryingNeighborhood`, drop cached locks. The
    /// only recovery path from lease failure during join or a denied
    /// unlock (spec.md §4.3).
    pub fn restart(&mut self, new_instance: NodeInstance) {
        self.this_node = new_instance;
        self.phase = JoinPhase::QueryingNeighborhood;
        self.extended_neighborhood.clear();
        self.neighborhood_range = None;
        self.locks_held.clear();
        self.leases_established.clear();
        self.throttled_until = None;
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled_until.map(|until| Instant::now() < until).unwrap_or(false)
    }

    pub fn apply_throttle(&mut self, header: JoinThrottleHeader) {
        self.throttled_until = Some(header.deadline);
    }

    /// `QueryingNeighborhood` entry/reply: seed the extended neighborhood
    /// from the ring's current view and, once it satisfies readiness
    /// (enough routing nodes known), advance to `Locking`.
    pub fn on_neighborhood_query_reply(&mut self, ring: &Ring, required_count: usize) {
        if self.phase != JoinPhase::QueryingNeighborhood || self.is_throttled() {
            return;
        }
        let (range, _) = ring.get_hood();
        self.neighborhood_range = Some(range);
        self.extended_neighborhood = ring.get_extended_hood();
        if self.extended_neighborhood.len() >= required_count {
            self.phase = JoinPhase::Locking;
        }
    }

    /// `Locking`: request a join-lock from every extended neighbor via
    /// `transport`. Completion requires every neighbor's lock held *and* the
    /// neighborhood range contiguous (spec.md §4.3) — the range snapshotted
    /// from the query reply must still cover every locked neighbor with no
    /// gap.
    pub async fn drive_locking(&mut self, transport: &dyn MessageTransport) -> Result<()> {
        if self.phase != JoinPhase::Locking {
            return Ok(());
        }
        for neighbor in self.extended_neighborhood.clone() {
            if self.locks_held.iter().any(|n| n.id == neighbor.id) {
                continue;
            }
            let address = transport
                .resolve_address(neighbor.id)
                .await
                .ok_or(FederationError::TransportAddressUnknown { target: neighbor.id })?;
            transport
                .send(&neighbor, &address, lock_request_payload(self.this_node))
                .await
                .map_err(|source| FederationError::TransportSend { target: neighbor.id, source })?;
            self.locks_held.push(neighbor);
        }
        let all_locked = self.locks_held.len() == self.extended_neighborhood.len();
        let contiguous = self
            .neighborhood_range
            .map(|range| range_is_contiguous(&self.extended_neighborhood, range))
            .unwrap_or(false);
        if all_locked && contiguous {
            self.phase = JoinPhase::EstablishingLease;
        }
        Ok(())
    }

    /// `EstablishingLease`: establish a lease against every extended
    /// neighbor in parallel; failure of any restarts the join (reported to
    /// the caller, which owns the restart/instance bump).
    pub async fn drive_lease_establishment(&mut self, lease_agent: &dyn LeaseAgent, addresses: &[(NodeInstance, String)]) -> Result<()> {
        if self.phase != JoinPhase::EstablishingLease {
            return Ok(());
        }
        for (neighbor, address) in addresses {
            if self.leases_established.iter().any(|n| n.id == neighbor.id) {
                continue;
            }
            lease_agent
                .establish(neighbor.id, address)
                .await
                .map_err(|source| FederationError::LeaseEstablishFailed { reason: source.to_string() })?;
            self.leases_established.push(*neighbor);
        }
        if self.leases_established.len() == self.extended_neighborhood.len() {
            self.phase = JoinPhase::UnLocking;
        }
        Ok(())
    }

    /// `UnLocking`: release every held lock. On deny (owner changed) the
    /// caller should treat this as a restart trigger; here we simply clear
    /// our bookkeeping once the transport confirms.
    pub async fn drive_unlocking(&mut self, transport: &dyn MessageTransport) -> Result<()> {
        if self.phase != JoinPhase::UnLocking {
            return Ok(());
        }
        for neighbor in self.locks_held.clone() {
            let address = transport
                .resolve_address(neighbor.id)
                .await
                .ok_or(FederationError::TransportAddressUnknown { target: neighbor.id })?;
            transport
                .send(&neighbor, &address, unlock_payload(self.this_node))
                .await
                .map_err(|source| FederationError::TransportSend { target: neighbor.id, source })?;
        }
        self.locks_held.clear();
        self.phase = JoinPhase::Routing;
        Ok(())
    }

    /// `Routing`: the join completed; the caller transitions the local
    /// `PartnerNode` to `Routing` and starts ping/update.
    pub fn completed_phase(&self) -> Phase {
        if self.phase == JoinPhase::Routing {
            Phase::Routing
        } else {
            Phase::Joining
        }
    }
}

fn lock_request_payload(from: NodeInstance) -> Vec<u8> {
    format!("join-lock-request:{}", from).into_bytes()
}

fn unlock_payload(from: NodeInstance) -> Vec<u8> {
    format!("join-unlock:{}", from).into_bytes()
}

/// Every member reported by the query reply must still fall inside the
/// range snapshotted at query time — a gap means some node between them
/// went undiscovered, so the neighborhood is not yet safe to lock against.
fn range_is_contiguous(members: &[NodeInstance], range: NodeIdRange) -> bool {
    members.iter().all(|m| range.contains(m.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::NodeId;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeTransport {
        sent: Mutex<Vec<(NodeId, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        async fn send(&self, target: &NodeInstance, _address: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((target.id, payload));
            Ok(())
        }

        async fn send_request(
            &self,
            target: &NodeInstance,
            _address: &str,
            payload: Vec<u8>,
            _timeout: std::time::Duration,
        ) -> Result<Vec<u8>, crate::contracts::SendRequestError> {
            self.sent.lock().unwrap().push((target.id, payload.clone()));
            Ok(payload)
        }

        async fn resolve_address(&self, _target: NodeId) -> Option<String> {
            Some("mock-addr".into())
        }
    }

    fn inst(id: u128) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), 1)
    }

    #[test]
    fn restart_resets_all_bookkeeping() {
        let mut state = JoinState::new(inst(1));
        state.phase = JoinPhase::Locking;
        state.locks_held.push(inst(2));
        state.restart(NodeInstance::new(NodeId::new(1), 2));
        assert_eq!(state.phase(), JoinPhase::QueryingNeighborhood);
        assert!(state.locks_held.is_empty());
        assert_eq!(state.this_node.instance_id, 2);
    }

    #[tokio::test]
    async fn locking_advances_once_all_neighbors_locked() {
        let mut state = JoinState::new(inst(1));
        state.phase = JoinPhase::Locking;
        state.extended_neighborhood = vec![inst(2), inst(3)];
        let transport = FakeTransport { sent: Mutex::new(Vec::new()) };
        state.drive_locking(&transport).await.unwrap();
        assert_eq!(state.phase(), JoinPhase::EstablishingLease);
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }
}
