//! Integration tests for the PostgreSQL outbox.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p courier-notifier --test integration -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use courier_common::types::DeliveryStatus;
use courier_limiter::TierSet;
use courier_notifier::dispatch::{Dispatcher, DispatcherConfig};
use courier_notifier::sender::{SendError, TransportSender};
use courier_notifier::store::{MessageStore, PgMessageStore};

/// Create a store connected to the test database with an empty outbox.
async fn setup(pool: &PgPool) -> PgMessageStore {
    let store = PgMessageStore::new(pool.clone());
    store.migrate().await.unwrap();

    sqlx::query("DELETE FROM sms_messages")
        .execute(pool)
        .await
        .unwrap();

    store
}

/// Back-date a message so ordering does not depend on insert timing.
async fn set_created_at(pool: &PgPool, id: uuid::Uuid, age_secs: i64) {
    sqlx::query("UPDATE sms_messages SET created_at = $2 WHERE id = $1")
        .bind(id)
        .bind(Utc::now() - chrono::Duration::seconds(age_secs))
        .execute(pool)
        .await
        .unwrap();
}

struct AcceptAll;

#[async_trait]
impl TransportSender for AcceptAll {
    async fn send(&self, _recipient: &str, _body: &str) -> Result<(), SendError> {
        Ok(())
    }
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL, run explicitly with --ignored
async fn test_enqueue_and_fetch_oldest_first(pool: PgPool) {
    let store = setup(&pool).await;

    let newer = store.enqueue("+15550001", "newer").await.unwrap();
    let older = store.enqueue("+15550002", "older").await.unwrap();
    set_created_at(&pool, newer.id, 10).await;
    set_created_at(&pool, older.id, 60).await;

    let batch = store.fetch_pending(100).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, older.id, "Oldest message must come first");
    assert_eq!(batch[1].id, newer.id);
    assert!(batch.iter().all(|m| m.sent_at.is_none()));

    let limited = store.fetch_pending(1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[sqlx::test]
#[ignore]
async fn test_mark_sent_is_never_refetched(pool: PgPool) {
    let store = setup(&pool).await;

    let message = store.enqueue("+15550001", "hello").await.unwrap();
    let sent_at = Utc::now();
    store.mark_sent(message.id, sent_at).await.unwrap();

    assert!(store.fetch_pending(100).await.unwrap().is_empty());

    let stored = store.get(message.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert!(stored.sent_at.is_some());

    // A second update keeps the first timestamp.
    store
        .mark_sent(message.id, sent_at + chrono::Duration::hours(1))
        .await
        .unwrap();
    let again = store.get(message.id).await.unwrap();
    assert_eq!(again.sent_at, stored.sent_at);
}

#[sqlx::test]
#[ignore]
async fn test_mark_failed_retry_and_abandon(pool: PgPool) {
    let store = setup(&pool).await;

    let retried = store.enqueue("+15550001", "retry me").await.unwrap();
    let abandoned = store.enqueue("+15550002", "give up").await.unwrap();

    store
        .mark_failed(
            retried.id,
            1,
            "Gateway rejected message",
            Some(Utc::now() + chrono::Duration::minutes(10)),
        )
        .await
        .unwrap();
    store
        .mark_failed(abandoned.id, 5, "Gateway rejected message", None)
        .await
        .unwrap();

    // Neither is due: one is scheduled in the future, the other is failed.
    assert!(store.fetch_pending(100).await.unwrap().is_empty());

    let retried = store.get(retried.id).await.unwrap();
    assert_eq!(retried.status, DeliveryStatus::Pending);
    assert_eq!(retried.attempts, 1);

    let abandoned = store.get(abandoned.id).await.unwrap();
    assert_eq!(abandoned.status, DeliveryStatus::Failed);
    assert_eq!(abandoned.error_detail.as_deref(), Some("Gateway rejected message"));

    // Once the retry is due it comes back.
    sqlx::query("UPDATE sms_messages SET next_attempt_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(retried.id)
        .execute(&pool)
        .await
        .unwrap();
    let batch = store.fetch_pending(100).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, retried.id);
}

#[sqlx::test]
#[ignore]
async fn test_dispatcher_drains_outbox(pool: PgPool) {
    let store = setup(&pool).await;
    for i in 0..5 {
        store
            .enqueue(&format!("+1555000{}", i), "hello")
            .await
            .unwrap();
    }

    let tiers = TierSet::from_pairs(&[(Duration::from_millis(20), 1)]).unwrap();
    let handle = Dispatcher::new(
        tiers,
        Arc::new(store.clone()),
        Arc::new(AcceptAll),
        DispatcherConfig::default(),
    )
    .start();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.sent, 5);
    let (pending,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM sms_messages WHERE status = 'pending'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(pending, 0);
}
