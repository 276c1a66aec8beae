//! Tiered admission controller.
//!
//! Every tier runs its own periodic timer. The primary timer is the heartbeat:
//! each of its ticks asks the controller whether a send is allowed. Secondary
//! timers hard-reset their tier's remaining quota to capacity; unused quota
//! from a quiet window is forfeited, not carried over.
//!
//! State is held in-memory and touched by a single dispatcher task, so no
//! locking is needed. A restart resets every quota to full capacity.

use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::tier::TierSet;

/// Which tier timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierTick {
    /// The pacing tier; time to ask for admission.
    Primary,
    /// A secondary tier, by index into [`TierSet::tiers`] (always `>= 1`).
    Secondary(usize),
}

/// Per-tier quota bookkeeping.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    tiers: TierSet,
    /// Remaining quota of each secondary tier; `remaining[i]` belongs to tier `i + 1`.
    remaining: Vec<u32>,
}

impl AdmissionController {
    pub fn new(tiers: TierSet) -> Self {
        let remaining = tiers.secondaries().iter().map(|t| t.capacity()).collect();
        Self { tiers, remaining }
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Decide whether the current primary tick may attempt a send.
    ///
    /// Admits only if every secondary tier still has quota. A closed tier
    /// (capacity 0) therefore blocks the channel for good, as does a closed
    /// primary tier.
    pub fn on_primary_tick(&self) -> bool {
        if self.tiers.primary().is_closed() {
            return false;
        }
        self.remaining.iter().all(|&left| left > 0)
    }

    /// Restore a secondary tier's quota to its full capacity.
    ///
    /// `tier_index` addresses [`TierSet::tiers`]; the primary tier and
    /// out-of-range indices are ignored.
    pub fn on_secondary_tick(&mut self, tier_index: usize) {
        let Some(slot) = tier_index
            .checked_sub(1)
            .and_then(|i| self.remaining.get_mut(i))
        else {
            return;
        };
        let capacity = self.tiers.tiers()[tier_index].capacity();
        if *slot != capacity {
            tracing::trace!(tier = tier_index, capacity, "Rate tier quota reset");
        }
        *slot = capacity;
    }

    /// Charge a send attempt against every secondary tier.
    ///
    /// Each tier loses [`TierSet::step`] units, saturating at zero.
    pub fn record_admission(&mut self) {
        let step = self.tiers.step();
        for (i, left) in self.remaining.iter_mut().enumerate() {
            *left = left.saturating_sub(step);
            if *left == 0 {
                tracing::debug!(tier = i + 1, "Rate tier quota exhausted");
            }
        }
    }

    /// Remaining quota of a secondary tier, or `None` for the primary tier.
    pub fn remaining(&self, tier_index: usize) -> Option<u32> {
        tier_index
            .checked_sub(1)
            .and_then(|i| self.remaining.get(i))
            .copied()
    }

    /// Create one periodic timer per tier, starting now.
    pub fn timers(&self) -> TierTimers {
        TierTimers::new(&self.tiers)
    }
}

/// Fan-in over the per-tier timers.
///
/// Each timer first fires one full period after creation. Missed ticks are
/// skipped rather than replayed, so a slow send never causes a burst.
#[derive(Debug)]
pub struct TierTimers {
    primary: Interval,
    secondaries: Vec<Interval>,
}

impl TierTimers {
    pub fn new(tiers: &TierSet) -> Self {
        let start = Instant::now();
        let make = |period: Duration| {
            let mut timer = tokio::time::interval_at(start + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        };

        Self {
            primary: make(tiers.primary().period()),
            secondaries: tiers.secondaries().iter().map(|t| make(t.period())).collect(),
        }
    }

    /// Wait for whichever timer fires next.
    ///
    /// When several are due at the same instant the secondary resets are
    /// reported before the primary tick. Cancel safe: dropping the future
    /// never loses a tick.
    pub async fn next(&mut self) -> TierTick {
        poll_fn(|cx| {
            for (i, timer) in self.secondaries.iter_mut().enumerate() {
                if timer.poll_tick(cx).is_ready() {
                    return Poll::Ready(TierTick::Secondary(i + 1));
                }
            }
            if self.primary.poll_tick(cx).is_ready() {
                return Poll::Ready(TierTick::Primary);
            }
            Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(pairs: &[(u64, u32)]) -> AdmissionController {
        let pairs: Vec<(Duration, u32)> = pairs
            .iter()
            .map(|&(ms, cap)| (Duration::from_millis(ms), cap))
            .collect();
        AdmissionController::new(TierSet::from_pairs(&pairs).unwrap())
    }

    #[test]
    fn test_initial_quota_is_capacity() {
        let ctl = controller(&[(1, 1), (100, 2), (1000, 10)]);
        assert_eq!(ctl.remaining(0), None);
        assert_eq!(ctl.remaining(1), Some(2));
        assert_eq!(ctl.remaining(2), Some(10));
        assert!(ctl.on_primary_tick());
    }

    #[test]
    fn test_exhaustion_then_recovery() {
        let mut ctl = controller(&[(1, 1), (100, 2)]);

        assert!(ctl.on_primary_tick());
        ctl.record_admission();
        assert!(ctl.on_primary_tick());
        ctl.record_admission();

        // Quota spent: blocked until the tier's own timer resets it.
        assert_eq!(ctl.remaining(1), Some(0));
        assert!(!ctl.on_primary_tick());
        assert!(!ctl.on_primary_tick());

        ctl.on_secondary_tick(1);
        assert_eq!(ctl.remaining(1), Some(2));
        assert!(ctl.on_primary_tick());
    }

    #[test]
    fn test_tightest_tier_wins() {
        let mut ctl = controller(&[(1, 1), (100, 2), (1000, 10)]);
        ctl.record_admission();
        ctl.record_admission();

        // The 1s tier still has 8 left, but the 100ms tier is empty.
        assert_eq!(ctl.remaining(2), Some(8));
        assert!(!ctl.on_primary_tick());

        ctl.on_secondary_tick(1);
        assert!(ctl.on_primary_tick());
    }

    #[test]
    fn test_reset_is_hard_not_additive() {
        let mut ctl = controller(&[(1, 1), (100, 5)]);
        ctl.on_secondary_tick(1);
        ctl.on_secondary_tick(1);
        assert_eq!(ctl.remaining(1), Some(5));
    }

    #[test]
    fn test_tiers_reset_independently() {
        let mut ctl = controller(&[(1, 1), (100, 2), (1000, 2)]);
        ctl.record_admission();
        ctl.record_admission();

        ctl.on_secondary_tick(1);
        assert_eq!(ctl.remaining(1), Some(2));
        assert_eq!(ctl.remaining(2), Some(0));
        assert!(!ctl.on_primary_tick());
    }

    #[test]
    fn test_closed_tier_never_admits() {
        let mut ctl = controller(&[(1, 1), (1000, 0)]);
        assert!(!ctl.on_primary_tick());
        ctl.on_secondary_tick(1);
        assert!(!ctl.on_primary_tick());
    }

    #[test]
    fn test_closed_primary_never_admits() {
        let ctl = controller(&[(1000, 0)]);
        assert!(!ctl.on_primary_tick());
    }

    #[test]
    fn test_single_tier_always_admits() {
        let mut ctl = controller(&[(10, 1)]);
        for _ in 0..100 {
            assert!(ctl.on_primary_tick());
            ctl.record_admission();
        }
    }

    #[test]
    fn test_step_saturates_at_zero() {
        let tiers = TierSet::from_pairs(&[
            (Duration::from_millis(10), 1),
            (Duration::from_millis(1000), 5),
        ])
        .unwrap()
        .with_step(3)
        .unwrap();
        let mut ctl = AdmissionController::new(tiers);

        ctl.record_admission();
        assert_eq!(ctl.remaining(1), Some(2));
        ctl.record_admission();
        assert_eq!(ctl.remaining(1), Some(0));
        assert!(!ctl.on_primary_tick());
    }

    #[test]
    fn test_out_of_range_reset_is_ignored() {
        let mut ctl = controller(&[(1, 1), (100, 2)]);
        ctl.record_admission();
        ctl.on_secondary_tick(0);
        ctl.on_secondary_tick(7);
        assert_eq!(ctl.remaining(1), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_after_one_period() {
        let ctl = controller(&[(10, 1), (25, 2)]);
        let mut timers = ctl.timers();
        let start = Instant::now();

        assert_eq!(timers.next().await, TierTick::Primary);
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        assert_eq!(timers.next().await, TierTick::Primary);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert_eq!(timers.next().await, TierTick::Secondary(1));
        assert_eq!(start.elapsed(), Duration::from_millis(25));
        assert_eq!(timers.next().await, TierTick::Primary);
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_accept_longest_period() {
        let tiers = TierSet::from_pairs(&[
            (Duration::from_millis(10), 1),
            (crate::tier::MAX_PERIOD, 5),
        ])
        .unwrap();
        let mut timers = AdmissionController::new(tiers).timers();

        assert_eq!(timers.next().await, TierTick::Primary);
        assert_eq!(timers.next().await, TierTick::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_reported_before_primary_on_same_instant() {
        let ctl = controller(&[(10, 1), (20, 2)]);
        let mut timers = ctl.timers();

        assert_eq!(timers.next().await, TierTick::Primary);
        assert_eq!(timers.next().await, TierTick::Secondary(1));
        assert_eq!(timers.next().await, TierTick::Primary);
    }
}
