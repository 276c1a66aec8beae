use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbox message delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting in the outbox (including messages scheduled for a retry).
    Pending,
    /// Handed to the gateway; never fetched again.
    Sent,
    /// Gave up after exhausting the retry budget.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A short message queued in the outbox for delivery to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingMessage {
    pub id: Uuid,
    pub recipient: String,
    pub body: String,
    pub status: DeliveryStatus,
    /// Number of failed delivery attempts so far.
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the message leaves the outbox as sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be attempted; `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

impl PendingMessage {
    /// Build a fresh pending message stamped with the current time.
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.into(),
            body: body.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            sent_at: None,
            next_attempt_at: None,
            error_detail: None,
        }
    }

    /// Whether the dispatcher may pick this message up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.sent_at.is_none()
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
