//! Routing Token Manager: split/probe/echo/recovery handshake that keeps
//! exactly one owner per identifier.
//!
//! Grounded on `original_source/src/prod/src/Federation/RoutingToken.Test.cpp` for the
//! version/accept semantics `RoutingToken` itself already implements; the
//! split/probe/echo-list recovery discipline here is reconstructed from
//! spec.md §4.2's prose (no surviving `RoutingTokenBalancer`/echo-list
//! source file in `original_source` past the index filter). Built in the
//! teacher's plain-struct, channel-free synchronous-core style, wrapped for
//! concurrent access the way `ring.rs` wraps `Ring`.

use std::collections::HashMap;

use crate::identifier::{NodeId, NodeIdRange};
use crate::token::RoutingToken;

/// Which side of the local node an edge-facing operation concerns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Pred,
    Succ,
}

/// A promise made to a peer on probe/echo: "I will not unilaterally recover
/// into a range closer than `distance` to you without hearing from you
/// first." Expires so a partition that heals doesn't leave a stale promise
/// blocking all future recovery forever.
#[derive(Clone, Copy, Debug)]
struct EchoPromise {
    distance: u128,
    expires_at: std::time::Instant,
}

pub struct TokenManager {
    token: RoutingToken,
    echo_promises: HashMap<NodeId, EchoPromise>,
    last_observed_version: HashMap<NodeId, u64>,
    promise_ttl: std::time::Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct SplitProposal {
    pub range: NodeIdRange,
    pub version: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ProbeMessage {
    pub direction: Direction,
    pub version: u64,
    pub distance: u128,
}

impl TokenManager {
    pub fn new(token: RoutingToken, promise_ttl: std::time::Duration) -> Self {
        TokenManager {
            token,
            echo_promises: HashMap::new(),
            last_observed_version: HashMap::new(),
            promise_ttl,
        }
    }

    pub fn token(&self) -> RoutingToken {
        self.token
    }

    /// `TrySplitToken`: if `neighbor` is closer to the far end of our range
    /// than we are, propose handing off the sub-range between `neighbor`
    /// and that end.
    pub fn try_split_token(&self, neighbor: NodeId) -> Option<SplitProposal> {
        if self.token.is_empty() {
            return None;
        }
        let range = self.token.range();
        if !range.contains(neighbor) {
            return None;
        }
        if neighbor == range.begin() || neighbor == range.end() {
            return None;
        }
        let dist_from_begin = range.begin().succ_dist(neighbor);
        let dist_from_end = neighbor.succ_dist(range.end());
        if dist_from_begin <= dist_from_end {
            // neighbor sits closer to our begin: it should own [begin, neighbor-1]
            let split_end = NodeId::new(neighbor.0.wrapping_sub(1));
            Some(SplitProposal {
                range: NodeIdRange::new(range.begin(), split_end),
                version: self.token.version(),
            })
        } else {
            let split_begin = NodeId::new(neighbor.0.wrapping_add(1));
            Some(SplitProposal {
                range: NodeIdRange::new(split_begin, range.end()),
                version: self.token.version(),
            })
        }
    }

    /// `GetProbeMessage`: the message to send periodically along `direction`,
    /// carrying our current version and the distance to that edge.
    pub fn probe_message(&self, direction: Direction, edge: NodeId) -> ProbeMessage {
        let range = self.token.range();
        let distance = match direction {
            Direction::Succ => range.end().succ_dist(edge),
            Direction::Pred => edge.succ_dist(range.begin()),
        };
        ProbeMessage {
            direction,
            version: self.token.version(),
            distance,
        }
    }

    /// `TokenProbeHandler`: a peer probed us; record how close a recovery
    /// they might attempt, and reply with an echo of our own version so
    /// they can validate their side.
    pub fn handle_probe(&mut self, from: NodeId, probe: ProbeMessage) -> u64 {
        self.echo_promises.insert(
            from,
            EchoPromise {
                distance: probe.distance,
                expires_at: std::time::Instant::now() + self.promise_ttl,
            },
        );
        self.token.version()
    }

    /// `TokenEchoHandler`: a peer echoed back in response to our probe,
    /// confirming the version they observed. Returns the version for the
    /// caller to compare against what was sent.
    pub fn handle_echo(&mut self, from: NodeId, echoed_version: u64) -> u64 {
        self.last_observed_version.insert(from, echoed_version);
        echoed_version
    }

    /// `Closer(distance)`: true if the recovery we're about to attempt
    /// stays within (or ties) the shortest distance we've promised `peer`,
    /// i.e. does not break an unexpired promise.
    fn closer(&self, peer: NodeId, recovered_distance: u128) -> bool {
        match self.echo_promises.get(&peer) {
            Some(promise) if promise.expires_at > std::time::Instant::now() => {
                recovered_distance <= promise.distance
            }
            _ => true,
        }
    }

    /// Recovery rule (spec.md §4.2): unilaterally extend the token into
    /// `dead_peer`'s former range, provided the neighborhood toward it is
    /// complete and no unexpired echo promise forbids it.
    pub fn try_recover(&mut self, dead_peer: NodeId, dead_peer_range: NodeIdRange, neighborhood_complete: bool) -> bool {
        if !neighborhood_complete || self.token.is_empty() {
            return false;
        }
        let recovered_distance = self.token.range().end().succ_dist(dead_peer_range.end());
        if !self.closer(dead_peer, recovered_distance) {
            return false;
        }
        let dead_token = RoutingToken::new(dead_peer_range, 0);
        let pred_adjacent = self.token.is_pred_adjacent(&dead_token);
        let succ_adjacent = self.token.is_succ_adjacent(&dead_token);
        if !pred_adjacent && !succ_adjacent {
            return false;
        }
        self.token.increment_recovery_version();
        let merged = if pred_adjacent {
            NodeIdRange::new(self.token.range().begin(), dead_peer_range.end())
        } else {
            NodeIdRange::new(dead_peer_range.begin(), self.token.range().end())
        };
        self.token = RoutingToken::new(merged, self.token.version());
        self.echo_promises.remove(&dead_peer);
        true
    }

    /// `TokenTransferHandler`/`TokenAcceptRejectHandler`: accept an inbound
    /// transfer iff the last version we observed from `source` was strictly
    /// less than `source_version`, delegating the merge arithmetic to
    /// `RoutingToken::accept`.
    pub fn accept_transfer(&mut self, source: NodeId, proposal: SplitProposal, caller: NodeId) -> bool {
        let last_seen = self.last_observed_version.get(&source).copied().unwrap_or(0);
        if proposal.version <= last_seen {
            return false;
        }
        let candidate = RoutingToken::new(proposal.range, proposal.version);
        if self.token.accept(&candidate, caller) {
            self.last_observed_version.insert(source, proposal.version);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_proposes_closer_sub_range() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(100));
        let mgr = TokenManager::new(RoutingToken::new(range, 1), std::time::Duration::from_secs(5));
        let proposal = mgr.try_split_token(NodeId::new(10)).unwrap();
        assert_eq!(proposal.range.begin(), NodeId::new(0));
        assert_eq!(proposal.range.end(), NodeId::new(9));
    }

    #[test]
    fn split_returns_none_outside_range() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(100));
        let mgr = TokenManager::new(RoutingToken::new(range, 1), std::time::Duration::from_secs(5));
        assert!(mgr.try_split_token(NodeId::new(200)).is_none());
    }

    #[test]
    fn recovery_respects_unexpired_echo_promise() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(50));
        let mut mgr = TokenManager::new(RoutingToken::new(range, 1), std::time::Duration::from_secs(5));
        let peer = NodeId::new(200);
        mgr.handle_probe(peer, ProbeMessage { direction: Direction::Succ, version: 1, distance: 5 });

        let dead_range = NodeIdRange::new(NodeId::new(51), NodeId::new(100));
        // recovered distance (100 - 51 = 49) exceeds the promised 5: must be rejected
        assert!(!mgr.try_recover(peer, dead_range, true));
    }

    #[test]
    fn recovery_succeeds_when_promise_is_satisfied() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(50));
        let mut mgr = TokenManager::new(RoutingToken::new(range, 1), std::time::Duration::from_secs(5));
        let peer = NodeId::new(51);
        mgr.handle_probe(peer, ProbeMessage { direction: Direction::Succ, version: 1, distance: 1000 });

        let dead_range = NodeIdRange::new(NodeId::new(51), NodeId::new(100));
        assert!(mgr.try_recover(peer, dead_range, true));
        assert_eq!(mgr.token().range().end(), NodeId::new(100));
    }

    #[test]
    fn transfer_rejected_when_not_newer_than_last_observed() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(50));
        let mut mgr = TokenManager::new(RoutingToken::new(range, 5), std::time::Duration::from_secs(5));
        let source = NodeId::new(100);
        mgr.last_observed_version.insert(source, 10);
        let proposal = SplitProposal {
            range: NodeIdRange::new(NodeId::new(51), NodeId::new(60)),
            version: 10,
        };
        assert!(!mgr.accept_transfer(source, proposal, NodeId::new(55)));
    }
}
