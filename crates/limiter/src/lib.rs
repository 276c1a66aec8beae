//! Tiered admission control for rate-limited outbound delivery.
//!
//! A [`TierSet`] describes several simultaneous `(period, capacity)` limits.
//! The tightest one paces the dispatcher (one tick per period) and the rest
//! are enforced as quotas that are hard-reset on their own timers by the
//! [`AdmissionController`].

pub mod admission;
pub mod tier;

pub use admission::{AdmissionController, TierTick, TierTimers};
pub use tier::{MAX_PERIOD, MAX_TIERS, RateTier, TierError, TierSet};
