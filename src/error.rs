//! Error taxonomy. Grounded on `types.rs::FsError`: one named variant per
//! failure class, each with its own `#[error(...)]` message, plus a
//! `.kind()` helper returning a stable string for logging/metrics call
//! sites that don't want to match on the enum.

use thiserror::Error;

use crate::identifier::{NodeId, NodeIdRange};

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("routing: no known hop could make progress toward {target}")]
    RoutingStuck { target: NodeId },

    #[error("routing: retry budget of {attempts} exhausted routing to {target}")]
    RetryExhausted { target: NodeId, attempts: u32 },

    #[error("routing: message held past deadline waiting for token {range} to arrive")]
    HoldingTimeout { range: NodeIdRange },

    #[error("join: throttled, {active} joins already admitted against a limit of {limit}")]
    JoinThrottled { active: usize, limit: usize },

    #[error("join: lock on range {range} already held by a concurrent join")]
    LockConflict { range: NodeIdRange },

    #[error("join: lease establishment failed: {reason}")]
    LeaseEstablishFailed { reason: String },

    #[error("token: {caller} rejected as not adjacent to range {range}")]
    TokenNotAdjacent { caller: NodeId, range: NodeIdRange },

    #[error("token: accept rejected, version {offered} does not exceed current {current}")]
    TokenStaleVersion { offered: u64, current: u64 },

    #[error("broadcast: no progress forwarding range {range}, all children unreachable")]
    BroadcastStalled { range: NodeIdRange },

    #[error("multicast: root node {root} unreachable and no failover candidate known")]
    MulticastRootUnreachable { root: NodeId },

    #[error("lease: arbitration against {opponent} failed: {reason}")]
    ArbitrationFailed { opponent: NodeId, reason: String },

    #[error("transport: send to {target} failed: {source}")]
    TransportSend {
        target: NodeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("transport: no address on record for {target}")]
    TransportAddressUnknown { target: NodeId },

    #[error("config: invalid value for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),
}

impl FederationError {
    pub fn kind(&self) -> &'static str {
        match self {
            FederationError::RoutingStuck { .. } => "RoutingStuck",
            FederationError::RetryExhausted { .. } => "RetryExhausted",
            FederationError::HoldingTimeout { .. } => "HoldingTimeout",
            FederationError::JoinThrottled { .. } => "JoinThrottled",
            FederationError::LockConflict { .. } => "LockConflict",
            FederationError::LeaseEstablishFailed { .. } => "LeaseEstablishFailed",
            FederationError::TokenNotAdjacent { .. } => "TokenNotAdjacent",
            FederationError::TokenStaleVersion { .. } => "TokenStaleVersion",
            FederationError::BroadcastStalled { .. } => "BroadcastStalled",
            FederationError::MulticastRootUnreachable { .. } => "MulticastRootUnreachable",
            FederationError::ArbitrationFailed { .. } => "ArbitrationFailed",
            FederationError::TransportSend { .. } => "TransportSend",
            FederationError::TransportAddressUnknown { .. } => "TransportAddressUnknown",
            FederationError::InvalidConfig { .. } => "InvalidConfig",
            FederationError::Persistence(_) => "Persistence",
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;
