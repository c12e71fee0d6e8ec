//! External collaborators, named only by contract (spec.md §6): message
//! transport, lease agent, and arbitrator. The core depends on these traits
//! exclusively so tests can supply in-memory fakes instead of real network,
//! lease, or arbitration machinery.
//!
//! Grounded on `net/mod.rs::networking()`'s entry-point shape (channels for
//! kernel messages, network errors, and printouts passed in rather than
//! owned) — generalized here into `async_trait` traits since the core needs
//! request/reply semantics per hop, not a single long-running task.

use std::time::Duration;

use async_trait::async_trait;

use crate::identifier::NodeId;
use crate::instance::NodeInstance;

/// A fault the *remote* side of a `SendRequest` explicitly reported, as
/// opposed to a local transport-level failure. The routing engine needs
/// these distinguished so a fault it surfaces to its caller reflects what
/// the destination actually said, not a guess made from a local error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RemoteRoutingFault {
    #[error("routing node does not match fault")]
    RoutingNodeDoesNotMatch,
    #[error("node is not routing fault")]
    NodeIsNotRouting,
    #[error("p2p node does not match fault")]
    P2PNodeDoesNotMatch,
}

/// Outcome of a `SendRequest` call.
#[derive(Debug, thiserror::Error)]
pub enum SendRequestError {
    #[error(transparent)]
    Remote(#[from] RemoteRoutingFault),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Sends an envelope to a remote node and is told, independently, whether
/// delivery to that transport address ever succeeded. Implementations own
/// their own retry/backoff at the socket level; the routing engine layers
/// its own retry semantics on top (spec.md §4.4) and treats any `Err` as a
/// single failed attempt.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, target: &NodeInstance, address: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// `SendRequest(message, target, timeout) -> reply | error` (spec.md
    /// §6): round-trips a request and returns the destination's actual
    /// reply bytes, or a fault the destination (or an intermediate hop)
    /// reported about the routing state it observed.
    async fn send_request(&self, target: &NodeInstance, address: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, SendRequestError>;

    /// Best-effort resolution of a currently reachable transport address
    /// for `target`, used when a partner record's cached address goes
    /// stale. `None` means "no better address known."
    async fn resolve_address(&self, target: NodeId) -> Option<String>;
}

/// Grants and monitors an implicit lease with a specific neighbor. A lease
/// is a promise from the agent that it will notify via `on_lease_expired`
/// (through the channel returned by the implementation) before silently
/// letting a neighbor it's watching go unmonitored.
#[async_trait]
pub trait LeaseAgent: Send + Sync {
    /// Establish or renew a lease with `partner` at `remote_lease_address`.
    /// Returns the lease's current instance identifier used to detect the
    /// agent restarting on the remote side.
    async fn establish(&self, partner: NodeId, remote_lease_address: &str) -> anyhow::Result<u64>;

    async fn terminate(&self, partner: NodeId) -> anyhow::Result<()>;

    /// Whether a previously established lease with `partner` is still
    /// believed active (no expiry observed).
    async fn is_active(&self, partner: NodeId) -> bool;
}

/// Resolves split-brain between two nodes that both believe they own an
/// overlapping arc, by appealing to a shared quorum outside the ring
/// (spec.md §4.8). Returns `true` if the caller wins arbitration and may
/// keep or reclaim the disputed range.
#[async_trait]
pub trait Arbitrator: Send + Sync {
    async fn arbitrate(&self, self_id: NodeId, opponent: NodeId, self_phase_epoch: u64, opponent_phase_epoch: u64) -> anyhow::Result<bool>;
}
