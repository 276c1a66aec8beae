//! Outbox storage: the durable queue the dispatcher drains.
//!
//! The dispatcher only needs to fetch a batch of due messages and record the
//! outcome of each attempt. Enqueueing happens elsewhere in the process and
//! may run concurrently with the dispatcher; both implementations here are
//! safe under that kind of shared use.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, PendingMessage};

/// Storage contract consumed by the dispatcher.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Up to `limit` due messages, oldest `created_at` first.
    ///
    /// Never returns a message that has been marked sent or abandoned.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingMessage>, AppError>;

    /// Record that a message left the outbox.
    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<(), AppError>;

    /// Record a failed attempt.
    ///
    /// With `retry_at` the message stays pending and becomes due again at that
    /// time; without it the message is abandoned as failed.
    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
}

/// PostgreSQL-backed outbox (`sms_messages` table).
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the outbox schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Queue a message for delivery.
    pub async fn enqueue(&self, recipient: &str, body: &str) -> Result<PendingMessage, AppError> {
        let message: PendingMessage = sqlx::query_as(
            r#"
            INSERT INTO sms_messages (id, recipient, body, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            RETURNING id, recipient, body, status, attempts, created_at, sent_at,
                      next_attempt_at, error_detail
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient)
        .bind(body)
        .bind(DeliveryStatus::Pending.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(message_id = %message.id, "SMS enqueued");
        Ok(message)
    }

    /// Look up a single message by ID.
    pub async fn get(&self, id: Uuid) -> Result<PendingMessage, AppError> {
        sqlx::query_as(
            r#"
            SELECT id, recipient, body, status, attempts, created_at, sent_at,
                   next_attempt_at, error_detail
            FROM sms_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("SMS {} not found", id)))
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingMessage>, AppError> {
        let messages: Vec<PendingMessage> = sqlx::query_as(
            r#"
            SELECT id, recipient, body, status, attempts, created_at, sent_at,
                   next_attempt_at, error_detail
            FROM sms_messages
            WHERE status = 'pending'
              AND sent_at IS NULL
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<(), AppError> {
        // `sent_at IS NULL` keeps the first timestamp if a duplicate update slips through.
        let result = sqlx::query(
            r#"
            UPDATE sms_messages
            SET status = $2, sent_at = $3, next_attempt_at = NULL
            WHERE id = $1 AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(DeliveryStatus::Sent.to_string())
        .bind(sent_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id = %id, "SMS already marked sent or missing");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let status = if retry_at.is_some() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Failed
        };

        sqlx::query(
            r#"
            UPDATE sms_messages
            SET status = $2, attempts = $3, error_detail = $4, next_attempt_at = $5
            WHERE id = $1 AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(attempts)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Process-local outbox, for embedding without a database and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<PendingMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for delivery.
    pub fn enqueue(&self, recipient: &str, body: &str) -> PendingMessage {
        let message = PendingMessage::new(recipient, body);
        self.insert(message.clone());
        message
    }

    /// Insert a fully-formed message, e.g. one with a back-dated `created_at`.
    pub fn insert(&self, message: PendingMessage) {
        self.lock().push(message);
    }

    pub fn get(&self, id: Uuid) -> Option<PendingMessage> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Number of messages still waiting for delivery (including scheduled retries).
    pub fn pending_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|m| m.status == DeliveryStatus::Pending)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingMessage>> {
        // A panic while holding the lock cannot leave a message half-written.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut PendingMessage)) -> Result<(), AppError> {
        let mut messages = self.lock();
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| AppError::NotFound(format!("SMS {} not found", id)))?;
        f(message);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingMessage>, AppError> {
        let now = Utc::now();
        let mut due: Vec<PendingMessage> = self
            .lock()
            .iter()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<(), AppError> {
        self.update(id, |m| {
            if m.sent_at.is_none() {
                m.status = DeliveryStatus::Sent;
                m.sent_at = Some(sent_at);
                m.next_attempt_at = None;
            }
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.update(id, |m| {
            if m.sent_at.is_some() {
                return;
            }
            m.attempts = attempts;
            m.error_detail = Some(error.to_string());
            m.next_attempt_at = retry_at;
            m.status = if retry_at.is_some() {
                DeliveryStatus::Pending
            } else {
                DeliveryStatus::Failed
            };
        })
    }
}
