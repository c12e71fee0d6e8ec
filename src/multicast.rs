//! Multicast engine: deliver a message to an explicit target set by
//! building forwarding subtrees (spec.md §4.6).
//!
//! Grounded on `original_source/src/prod/src/Federation/MulticastForwardContext.h`/`.cpp`
//! and `MulticastManager.cpp` for the propagation-factor subtree split,
//! root-ack aggregation, and root-failover behavior.

use std::collections::HashSet;

use crate::identifier::NodeId;
use crate::instance::NodeInstance;

#[derive(Clone, Debug, Default)]
pub struct MulticastTargetsHeader {
    pub subordinates: Vec<NodeInstance>,
}

/// One subtree: a root plus the subordinates it is responsible for
/// recursively re-partitioning.
#[derive(Clone, Debug)]
pub struct Subtree {
    pub root: NodeInstance,
    pub subordinates: Vec<NodeInstance>,
}

/// Partition `targets` (already deduped, sorted by id) into up to
/// `propagation_factor` near-equal subtrees, each rooted at its median.
pub fn partition(mut targets: Vec<NodeInstance>, propagation_factor: usize) -> Vec<Subtree> {
    targets.sort_by_key(|t| t.id.0);
    targets.dedup_by_key(|t| t.id);
    if targets.is_empty() || propagation_factor == 0 {
        return Vec::new();
    }
    let chunk_size = (targets.len() + propagation_factor - 1) / propagation_factor;
    targets
        .chunks(chunk_size.max(1))
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            let root_idx = chunk.len() / 2;
            let root = chunk[root_idx];
            let subordinates = chunk
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != root_idx)
                .map(|(_, t)| *t)
                .collect();
            Subtree { root, subordinates }
        })
        .collect()
}

/// Forwarding state kept at one hop for one multicast id. Accumulates
/// `failed`/`unknown` from descendants and supports root failover and
/// late-arriving duplicate merges.
pub struct MulticastForwardContext {
    remaining: Vec<NodeInstance>,
    current_root: Option<NodeInstance>,
    failed: HashSet<NodeId>,
    unknown: HashSet<NodeId>,
    propagation_factor: usize,
}

impl MulticastForwardContext {
    pub fn new(targets: Vec<NodeInstance>, propagation_factor: usize) -> Self {
        let mut ctx = MulticastForwardContext {
            remaining: targets,
            current_root: None,
            failed: HashSet::new(),
            unknown: HashSet::new(),
            propagation_factor,
        };
        ctx.pick_root();
        ctx
    }

    fn pick_root(&mut self) {
        self.current_root = self.remaining.get(self.remaining.len() / 2).copied();
    }

    pub fn current_root(&self) -> Option<NodeInstance> {
        self.current_root
    }

    pub fn subordinates(&self) -> Vec<NodeInstance> {
        match self.current_root {
            Some(root) => self.remaining.iter().filter(|t| t.id != root.id).copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn subtrees(&self) -> Vec<Subtree> {
        partition(self.subordinates(), self.propagation_factor)
    }

    /// The current root failed to ack: mark it failed, pick a new root from
    /// the middle of the remaining subordinates, and report whether the
    /// subtree is now empty (fully closed).
    pub fn fail_root(&mut self) -> bool {
        if let Some(root) = self.current_root.take() {
            self.failed.insert(root.id);
            self.remaining.retain(|t| t.id != root.id);
        }
        if self.remaining.is_empty() {
            true
        } else {
            self.pick_root();
            false
        }
    }

    /// A descendant reported its own `(failed, unknown)` set on exhausting
    /// its subordinates; merge it into ours for propagation to our parent.
    pub fn merge_descendant_report(&mut self, failed: &[NodeId], unknown: &[NodeId]) {
        self.failed.extend(failed.iter().copied());
        self.unknown.extend(unknown.iter().copied());
    }

    /// Deduplication: a repeat arrival of the same multicast id contributes
    /// any not-yet-seen targets to this context rather than opening a new
    /// one.
    pub fn merge_targets(&mut self, extra: Vec<NodeInstance>) {
        for t in extra {
            if !self.remaining.iter().any(|r| r.id == t.id) && !self.failed.contains(&t.id) {
                self.remaining.push(t);
            }
        }
        if self.current_root.is_none() {
            self.pick_root();
        }
    }

    pub fn report(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        (self.failed.iter().copied().collect(), self.unknown.iter().copied().collect())
    }
}
