//! RoutingToken: the half-open arc of the identifier space owned by exactly
//! one node, plus the split version number that mediates handoff.
//!
//! Version semantics grounded on
//! `original_source/src/prod/src/Federation/RoutingToken.Test.cpp`: the version is split
//! into a low "merge" half and a high "recovery" half; incrementing the
//! recovery half zeros the merge half.

use crate::identifier::{NodeId, NodeIdRange};
use serde::{Deserialize, Serialize};

const MERGE_BITS: u32 = 32;
const MERGE_MASK: u64 = (1u64 << MERGE_BITS) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoutingToken {
    range: NodeIdRange,
    version: u64,
}

impl Default for RoutingToken {
    fn default() -> Self {
        RoutingToken {
            range: NodeIdRange::EMPTY,
            version: 0,
        }
    }
}

impl RoutingToken {
    pub fn new(range: NodeIdRange, version: u64) -> Self {
        RoutingToken { range, version }
    }

    pub fn range(&self) -> NodeIdRange {
        self.range
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.range.is_full()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.range.contains(id)
    }

    fn merge_half(version: u64) -> u64 {
        version & MERGE_MASK
    }

    fn recovery_half(version: u64) -> u64 {
        version >> MERGE_BITS
    }

    /// Bump the high (recovery) half and zero the low (merge) half.
    pub fn increment_recovery_version(&mut self) {
        let recovery = Self::recovery_half(self.version) + 1;
        self.version = recovery << MERGE_BITS;
    }

    /// Safe to apply a unilateral recovery that claims to be at
    /// `prior_version` iff our recovery half is not already ahead of it.
    pub fn is_recovery_safe(&self, prior_version: u64) -> bool {
        self.version >= prior_version
    }

    /// Safe to apply a merge transfer that claims to originate from
    /// `prior_version` iff it strictly precedes our current version.
    pub fn is_merge_safe(&self, prior_version: u64) -> bool {
        prior_version < self.version
    }

    pub fn is_pred_adjacent(&self, other: &RoutingToken) -> bool {
        self.range.is_pred_adjacent(&other.range)
    }

    pub fn is_succ_adjacent(&self, other: &RoutingToken) -> bool {
        self.range.is_succ_adjacent(&other.range)
    }

    /// Merge `other`'s range into `self` if the two are adjacent and
    /// `caller` sits between them (i.e. the transfer is being witnessed by
    /// the node that will end up owning the combined range). Returns
    /// `true` and mutates `self` on success; returns `false` (no mutation)
    /// if the tokens are not adjacent or `other`'s version does not
    /// strictly exceed the version `self` last observed from that peer.
    ///
    /// A token with an empty range can only ever be the *acceptor* of a
    /// predecessor-side transfer that replaces both ends (matching the
    /// original's `AcceptThrow` case, which asserts rather than silently
    /// inheriting — we instead return `false`, since this crate prefers
    /// explicit `Result`/`bool` returns to panics on expected races).
    pub fn accept(&mut self, other: &RoutingToken, caller: NodeId) -> bool {
        if other.version <= self.version {
            return false;
        }
        if self.is_empty() {
            return false;
        }
        if self.is_pred_adjacent(other) && other.range.contains(caller) {
            self.range = NodeIdRange::new(self.range.begin(), other.range.end());
            self.version = other.version;
            return true;
        }
        if self.is_succ_adjacent(other) && other.range.contains(caller) {
            self.range = NodeIdRange::new(other.range.begin(), self.range.end());
            self.version = other.version;
            return true;
        }
        false
    }
}

impl std::fmt::Display for RoutingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.range, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_has_zero_version() {
        let token = RoutingToken::default();
        assert!(token.is_empty());
        assert!(!token.is_full());
        assert_eq!(token.version(), 0);
    }

    #[test]
    fn recovery_increment_zeros_merge_half() {
        let mut token = RoutingToken::new(NodeIdRange::EMPTY, 3u64 << MERGE_BITS);
        assert!(!token.is_merge_safe(1u64 << MERGE_BITS));
        assert!(token.is_merge_safe((3u64 << MERGE_BITS) - 1));
        token.increment_recovery_version();
        assert_eq!(token.version(), 4u64 << MERGE_BITS);
    }

    #[test]
    fn accept_merges_adjacent_ranges_and_rejects_stale_or_disjoint() {
        let start1 = NodeId::new(0x0007);
        let end1 = NodeId::new(0x0100_0001);
        let start2 = NodeId::new(0x9_0000_0001);
        let end2 = NodeId::new(0x0006);
        let start3 = NodeId::new(0x1_0000_0002);
        let end3 = NodeId::new(0x3_0000_0003);

        let mut token1 = RoutingToken::new(NodeIdRange::new(start1, end1), 1);
        let token2 = RoutingToken::new(NodeIdRange::new(start2, end2), 2);
        let token3 = RoutingToken::new(NodeIdRange::new(start3, end3), 2);
        let mut token5 = RoutingToken::new(NodeIdRange::point(start1), 1);

        // token2 is pred-adjacent to token1 (token2.end + 1 == token1.begin)
        assert!(token1.is_pred_adjacent(&token2));
        assert!(token1.accept(&token2, NodeId::new(0x9_0000_0002)));
        assert_eq!(token1.range().begin(), start2);
        assert_eq!(token1.range().end(), end1);

        let mut token3_for_merge = RoutingToken::new(NodeIdRange::new(start3, end3), 3);
        assert!(token1.is_succ_adjacent(&token3_for_merge));
        assert!(token1.accept(&token3_for_merge, NodeId::new(0x1_0000_0003)));
        assert_eq!(token1.range().begin(), start2);
        assert_eq!(token1.range().end(), end3);

        // disjoint ranges never merge
        let mut token2_copy = token2;
        assert!(!token2_copy.accept(&token3, NodeId::new(0x2_0000_0004)));

        // a zero-width token with no established range can't be widened via accept
        assert!(!token5.accept(&token3, NodeId::new(0x9_0000_0002)));

        let _ = &mut token3_for_merge;
    }

    #[test]
    fn stale_version_is_rejected() {
        let range = NodeIdRange::new(NodeId::new(0), NodeId::new(100));
        let mut current = RoutingToken::new(range, 5);
        let stale = RoutingToken::new(NodeIdRange::new(NodeId::new(101), NodeId::new(200)), 5);
        assert!(!current.accept(&stale, NodeId::new(101)));
    }
}
