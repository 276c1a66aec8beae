//! Rate tiers: the `(period, capacity)` limits a channel must honour at once.
//!
//! Tiers are ordered by their average pacing (`period / capacity`). The tier
//! with the smallest pacing becomes the primary tier: its period is the
//! dispatcher heartbeat. Every other tier is a secondary tier whose quota is
//! spent by each send and restored when its own period elapses.

use std::cmp::Ordering;
use std::time::Duration;

use thiserror::Error;

/// Maximum number of simultaneous rate tiers.
pub const MAX_TIERS: usize = 5;

/// Longest accepted tier period (ten years).
pub const MAX_PERIOD: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Configuration errors raised while building a [`TierSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    #[error("at least one rate tier is required")]
    Empty,

    #[error("{count} rate tiers configured, at most {max} are supported")]
    TooMany { count: usize, max: usize },

    #[error("rate tier #{index} has a zero period")]
    ZeroPeriod { index: usize },

    #[error("rate tier #{index} has a period longer than {max:?}")]
    PeriodTooLong { index: usize, max: Duration },

    #[error("send step must be greater than zero")]
    ZeroStep,
}

/// A single admission constraint: at most `capacity` sends per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateTier {
    period: Duration,
    capacity: u32,
}

impl RateTier {
    pub fn new(period: Duration, capacity: u32) -> Self {
        Self { period, capacity }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// A zero-capacity tier never admits anything.
    pub fn is_closed(&self) -> bool {
        self.capacity == 0
    }

    /// Average time between sends this tier allows; `None` for a closed tier.
    pub fn unit_rate(&self) -> Option<Duration> {
        if self.is_closed() {
            None
        } else {
            Some(self.period / self.capacity)
        }
    }

    /// Compare by unit rate without rounding: `p1 / c1` vs `p2 / c2`.
    ///
    /// Closed tiers compare as infinitely slow.
    fn cmp_unit_rate(&self, other: &Self) -> Ordering {
        match (self.is_closed(), other.is_closed()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let lhs = self.period.as_nanos() * u128::from(other.capacity);
                let rhs = other.period.as_nanos() * u128::from(self.capacity);
                lhs.cmp(&rhs)
            }
        }
    }
}

impl From<(Duration, u32)> for RateTier {
    fn from((period, capacity): (Duration, u32)) -> Self {
        Self::new(period, capacity)
    }
}

/// Validated, ordered set of rate tiers. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSet {
    tiers: Vec<RateTier>,
    step: u32,
}

impl TierSet {
    /// Validate and order the given tiers.
    ///
    /// Ordering is ascending by unit rate and stable, so tiers with equal
    /// pacing keep their input order. The send step defaults to the primary
    /// tier's capacity; see [`TierSet::with_step`].
    pub fn new(tiers: impl IntoIterator<Item = RateTier>) -> Result<Self, TierError> {
        let mut tiers: Vec<RateTier> = tiers.into_iter().collect();

        if tiers.is_empty() {
            return Err(TierError::Empty);
        }
        if tiers.len() > MAX_TIERS {
            return Err(TierError::TooMany {
                count: tiers.len(),
                max: MAX_TIERS,
            });
        }
        if let Some(index) = tiers.iter().position(|t| t.period.is_zero()) {
            return Err(TierError::ZeroPeriod { index });
        }
        if let Some(index) = tiers.iter().position(|t| t.period > MAX_PERIOD) {
            return Err(TierError::PeriodTooLong {
                index,
                max: MAX_PERIOD,
            });
        }

        tiers.sort_by(RateTier::cmp_unit_rate);
        let step = tiers[0].capacity;

        Ok(Self { tiers, step })
    }

    /// Build from raw `(period, capacity)` pairs as they come out of configuration.
    pub fn from_pairs(pairs: &[(Duration, u32)]) -> Result<Self, TierError> {
        Self::new(pairs.iter().copied().map(RateTier::from))
    }

    /// Override the number of messages consumed from every secondary tier per send.
    ///
    /// Without an override this equals the primary tier's capacity, which
    /// operators normally configure as 1.
    pub fn with_step(mut self, step: u32) -> Result<Self, TierError> {
        if step == 0 {
            return Err(TierError::ZeroStep);
        }
        self.step = step;
        Ok(self)
    }

    /// The pacing tier (tier 0).
    pub fn primary(&self) -> &RateTier {
        &self.tiers[0]
    }

    /// Quota tiers, i.e. tiers `1..len()`.
    pub fn secondaries(&self) -> &[RateTier] {
        &self.tiers[1..]
    }

    pub fn tiers(&self) -> &[RateTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always `false`; a tier set holds at least one tier.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Messages consumed from every secondary tier per admitted send.
    pub fn step(&self) -> u32 {
        self.step
    }
}
