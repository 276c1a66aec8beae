//! Delivery policy for failed sends.
//!
//! Best effort marks a message sent whatever the gateway answered, so a
//! failure is never redelivered. Retry-with-backoff keeps the message pending
//! and reschedules it with an exponentially growing delay until the attempt
//! budget is spent. Either way every attempt consumes rate-tier quota.

use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_common::config::{AppConfig, DeliveryMode};

/// Exponential backoff with a ceiling.
///
/// Attempt `1` (the first failure) waits `base`; each further attempt doubles
/// the wait until it reaches `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// `max` is raised to `base` if it is smaller.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// What to do with a message after a send attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Mark every attempted message sent. No redelivery.
    #[default]
    BestEffort,
    /// Reschedule failures until `max_attempts` have failed, then give up.
    RetryWithBackoff { max_attempts: u32, backoff: Backoff },
}

/// Outcome of applying a [`DeliveryPolicy`] to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Treat the message as sent anyway.
    MarkSent,
    /// Keep it pending until `at`.
    Retry { attempts: i32, at: DateTime<Utc> },
    /// Stop trying and mark it failed.
    Abandon { attempts: i32 },
}

impl DeliveryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        match config.sms_delivery_policy {
            DeliveryMode::BestEffort => DeliveryPolicy::BestEffort,
            DeliveryMode::Retry => DeliveryPolicy::RetryWithBackoff {
                max_attempts: config.sms_max_attempts.max(1),
                backoff: Backoff::exponential(
                    Duration::from_millis(config.sms_retry_base_ms),
                    Duration::from_millis(config.sms_retry_max_ms),
                ),
            },
        }
    }

    /// Decide the fate of a message whose attempt just failed.
    ///
    /// `previous_attempts` is the failure count stored before this attempt.
    pub fn on_failure(&self, previous_attempts: i32, now: DateTime<Utc>) -> FailureAction {
        match *self {
            DeliveryPolicy::BestEffort => FailureAction::MarkSent,
            DeliveryPolicy::RetryWithBackoff {
                max_attempts,
                backoff,
            } => {
                let attempts = previous_attempts.saturating_add(1);
                let budget = i32::try_from(max_attempts).unwrap_or(i32::MAX);
                if attempts >= budget {
                    return FailureAction::Abandon { attempts };
                }
                let delay = backoff.delay(attempts.unsigned_abs());
                let at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                FailureAction::Retry { attempts, at }
            }
        }
    }
}
