//! Implicit lease context: predecessor/successor failure detection via
//! lease expiry and arbitration (spec.md §4.8).
//!
//! Grounded directly on spec.md §4.8's prose (no surviving `GlobalStore.cpp`
//! detail past the `original_source` filter beyond header shape) and on the
//! teacher's `async_trait`-based external-call idiom (an async call with a
//! typed reply, as in the shape `contracts.rs::Arbitrator` generalizes).

use std::time::{Duration, Instant};

use crate::contracts::Arbitrator;
use crate::identifier::NodeId;
use crate::instance::NodeInstance;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArbitrationOutcome {
    Granted,
    Rejected,
    Neutral,
    Delayed,
}

#[derive(Clone, Copy, Debug)]
struct LeaseRecord {
    partner: NodeInstance,
    subject_lease_expires_at: Instant,
    monitor_lease_expires_at: Instant,
    last_outcome: Option<ArbitrationOutcome>,
    last_ping_observed_at: Instant,
}

/// One side (predecessor or successor) of the implicit lease relationship.
pub struct LeaseSide {
    record: Option<LeaseRecord>,
    arbitration_window: Duration,
    ping_staleness: Duration,
}

impl LeaseSide {
    pub fn new(arbitration_window: Duration, ping_staleness: Duration) -> Self {
        LeaseSide {
            record: None,
            arbitration_window,
            ping_staleness,
        }
    }

    pub fn set_partner(&mut self, partner: NodeInstance, lease_duration: Duration) {
        let now = Instant::now();
        self.record = Some(LeaseRecord {
            partner,
            subject_lease_expires_at: now + lease_duration,
            monitor_lease_expires_at: now + lease_duration,
            last_outcome: None,
            last_ping_observed_at: now,
        });
    }

    pub fn clear(&mut self) {
        self.record = None;
    }

    pub fn observe_ping(&mut self) {
        if let Some(record) = &mut self.record {
            record.last_ping_observed_at = Instant::now();
        }
    }

    pub fn renew(&mut self, lease_duration: Duration) {
        if let Some(record) = &mut self.record {
            let now = Instant::now();
            record.subject_lease_expires_at = now + lease_duration;
            record.monitor_lease_expires_at = now + lease_duration;
        }
    }

    /// Whether this side needs to escalate to arbitration: the lease is
    /// within the arbitration window of expiring *and* no recent ping has
    /// been observed.
    pub fn needs_arbitration(&self) -> bool {
        match &self.record {
            None => false,
            Some(record) => {
                let now = Instant::now();
                let nearing_expiry = record.subject_lease_expires_at.saturating_duration_since(now) <= self.arbitration_window;
                let stale_ping = now.saturating_duration_since(record.last_ping_observed_at) > self.ping_staleness;
                nearing_expiry && stale_ping
            }
        }
    }

    /// Escalate to the arbitrator. On `Granted`/`Neutral` the lease is
    /// renewed; on `Rejected` the caller should demote the neighbor to
    /// `Shutdown`; `Delayed` leaves the record untouched for a retry.
    pub async fn arbitrate(&mut self, arbitrator: &dyn Arbitrator, self_id: NodeId, self_epoch: u64, opponent_epoch: u64) -> anyhow::Result<ArbitrationOutcome> {
        let Some(record) = self.record else {
            return Ok(ArbitrationOutcome::Neutral);
        };
        let granted = arbitrator.arbitrate(self_id, record.partner.id, self_epoch, opponent_epoch).await?;
        let outcome = if granted {
            ArbitrationOutcome::Granted
        } else {
            ArbitrationOutcome::Rejected
        };
        if let Some(r) = &mut self.record {
            r.last_outcome = Some(outcome);
        }
        if matches!(outcome, ArbitrationOutcome::Granted) {
            self.renew(self.default_renewal());
        }
        Ok(outcome)
    }

    fn default_renewal(&self) -> Duration {
        self.arbitration_window * 4
    }

    pub fn partner(&self) -> Option<NodeInstance> {
        self.record.map(|r| r.partner)
    }

    pub fn last_outcome(&self) -> Option<ArbitrationOutcome> {
        self.record.and_then(|r| r.last_outcome)
    }
}

/// Owns both sides. `neighborhood_lost_window` bounds how long this node
/// waits for a replacement neighbor after a demotion before declaring
/// neighborhood-lost.
pub struct LeaseContext {
    pub predecessor: LeaseSide,
    pub successor: LeaseSide,
    neighborhood_lost_window: Duration,
    demoted_at: Option<Instant>,
}

impl LeaseContext {
    pub fn new(arbitration_window: Duration, ping_staleness: Duration, neighborhood_lost_window: Duration) -> Self {
        LeaseContext {
            predecessor: LeaseSide::new(arbitration_window, ping_staleness),
            successor: LeaseSide::new(arbitration_window, ping_staleness),
            neighborhood_lost_window,
            demoted_at: None,
        }
    }

    pub fn mark_demotion(&mut self) {
        self.demoted_at = Some(Instant::now());
    }

    /// Whether neighborhood-lost should fire: a demotion happened and no
    /// replacement has arrived (caller clears `demoted_at` via
    /// `clear_demotion` once a replacement is set) within the policy
    /// window.
    pub fn is_neighborhood_lost(&self) -> bool {
        match self.demoted_at {
            Some(at) => at.elapsed() > self.neighborhood_lost_window,
            None => false,
        }
    }

    pub fn clear_demotion(&mut self) {
        self.demoted_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysGrant;

    #[async_trait]
    impl Arbitrator for AlwaysGrant {
        async fn arbitrate(&self, _self_id: NodeId, _opponent: NodeId, _a: u64, _b: u64) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct AlwaysReject;

    #[async_trait]
    impl Arbitrator for AlwaysReject {
        async fn arbitrate(&self, _self_id: NodeId, _opponent: NodeId, _a: u64, _b: u64) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn needs_arbitration_only_when_near_expiry_and_ping_stale() {
        let mut side = LeaseSide::new(Duration::from_secs(10), Duration::from_millis(1));
        side.set_partner(NodeInstance::new(NodeId::new(1), 1), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(side.needs_arbitration());
    }

    #[tokio::test]
    async fn rejected_arbitration_does_not_renew_lease() {
        let mut side = LeaseSide::new(Duration::from_secs(10), Duration::from_millis(1));
        side.set_partner(NodeInstance::new(NodeId::new(1), 1), Duration::from_millis(5));
        let outcome = side.arbitrate(&AlwaysReject, NodeId::new(0), 1, 1).await.unwrap();
        assert_eq!(outcome, ArbitrationOutcome::Rejected);
    }

    #[tokio::test]
    async fn granted_arbitration_renews_lease() {
        let mut side = LeaseSide::new(Duration::from_secs(10), Duration::from_millis(1));
        side.set_partner(NodeInstance::new(NodeId::new(1), 1), Duration::from_millis(5));
        let outcome = side.arbitrate(&AlwaysGrant, NodeId::new(0), 1, 1).await.unwrap();
        assert_eq!(outcome, ArbitrationOutcome::Granted);
        assert!(!side.needs_arbitration());
    }

    #[test]
    fn neighborhood_lost_fires_after_policy_window() {
        let mut ctx = LeaseContext::new(Duration::from_secs(1), Duration::from_millis(1), Duration::from_millis(5));
        ctx.mark_demotion();
        assert!(!ctx.is_neighborhood_lost());
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.is_neighborhood_lost());
    }
}
