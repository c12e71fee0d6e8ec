//! Join-lock admission and throttling (spec.md §4.3's "throttling"
//! paragraph). Grounded on `register.rs`'s phase-gated external-handshake
//! shape (request -> await -> confirm), generalized here into a standalone
//! admission-control object the join state machine consults rather than an
//! inline sequence of awaits, since throttling must react to concurrent
//! joiners, not just one.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::identifier::{NodeId, NodeIdRange};

#[derive(Clone, Copy, Debug)]
pub struct JoinThrottleHeader {
    pub deadline: Instant,
    pub query_side_needed: bool,
}

struct Waiter {
    joiner: NodeId,
    enqueued_at: Instant,
}

/// Tracks "competing" joiners against a neighborhood and throttles
/// admission once a high watermark of simultaneous joins is reached.
pub struct JoinLockManager {
    high_watermark: usize,
    low_watermark: usize,
    active_interval: Duration,
    held_locks: Vec<(NodeId, NodeIdRange)>,
    waiting: VecDeque<Waiter>,
}

impl JoinLockManager {
    pub fn new(high_watermark: usize, active_interval: Duration) -> Self {
        let low_watermark = high_watermark.saturating_sub(1).max(1);
        JoinLockManager {
            high_watermark,
            low_watermark,
            active_interval,
            held_locks: Vec::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.held_locks.len()
    }

    /// Try to admit `joiner` for a lock on `range`. Returns `Ok(())` if
    /// admitted, or the throttle header the joiner must sleep against
    /// otherwise.
    pub fn try_admit(&mut self, joiner: NodeId, range: NodeIdRange) -> Result<(), JoinThrottleHeader> {
        if self.held_locks.iter().any(|(_, held)| !held.disjoint(&range)) {
            return Err(JoinThrottleHeader {
                deadline: Instant::now() + self.active_interval,
                query_side_needed: true,
            });
        }
        if self.held_locks.len() >= self.high_watermark {
            self.waiting.push_back(Waiter {
                joiner,
                enqueued_at: Instant::now(),
            });
            return Err(JoinThrottleHeader {
                deadline: Instant::now() + self.active_interval,
                query_side_needed: false,
            });
        }
        self.held_locks.push((joiner, range));
        Ok(())
    }

    pub fn release(&mut self, joiner: NodeId) {
        self.held_locks.retain(|(id, _)| *id != joiner);
    }

    /// Below the low watermark, resume waiters in insertion (FIFO) order.
    /// Returns the joiners that should now retry admission.
    pub fn drain_resumable(&mut self) -> Vec<NodeId> {
        let mut resumed = Vec::new();
        while self.held_locks.len() < self.low_watermark {
            match self.waiting.pop_front() {
                Some(waiter) => resumed.push(waiter.joiner),
                None => break,
            }
        }
        resumed
    }

    pub fn expire_stale_waiters(&mut self, max_age: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.waiting.retain(|w| {
            if now.duration_since(w.enqueued_at) > max_age {
                expired.push(w.joiner);
                false
            } else {
                true
            }
        });
        expired
    }
}
