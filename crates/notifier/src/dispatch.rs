//! Dispatch loop: drains the outbox through the gateway under tiered rate limits.
//!
//! One background task owns the admission controller, the per-tier timers and
//! a local batch of pending messages. On every primary tick it:
//! 1. Asks the controller for admission (skips the tick if refused)
//! 2. Pops the next message, refilling the batch from the store when empty
//! 3. Hands the message to the sender
//! 4. Persists the outcome according to the delivery policy and charges the
//!    attempt against every secondary tier
//!
//! Secondary ticks only reset their tier's quota. Store and transport errors
//! are logged and never stop the loop; only the shutdown signal does.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use courier_common::config::AppConfig;
use courier_common::types::PendingMessage;
use courier_limiter::{AdmissionController, TierSet, TierTick};

use crate::retry::{DeliveryPolicy, FailureAction};
use crate::sender::{SendError, TransportSender};
use crate::store::MessageStore;

/// Default number of messages fetched per store round-trip.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Tunables of the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on messages pulled into the local batch per fetch.
    pub batch_size: usize,
    /// Handling of failed sends.
    pub policy: DeliveryPolicy,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.sms_batch_size.max(1),
            policy: DeliveryPolicy::from_config(config),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            policy: DeliveryPolicy::BestEffort,
        }
    }
}

/// Live counters, updated by the worker and readable from any thread.
#[derive(Debug, Default)]
pub struct DispatchStats {
    sent: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Attempts the gateway accepted.
    pub sent: u64,
    /// Attempts the gateway refused or that never reached it.
    pub failed: u64,
    /// Primary ticks refused by the admission controller.
    pub throttled: u64,
    /// Failed fetches and failed outcome writes.
    pub store_errors: u64,
}

impl StatsSnapshot {
    /// Total send attempts.
    pub fn attempts(&self) -> u64 {
        self.sent + self.failed
    }
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The single dispatch worker, before it is started.
pub struct Dispatcher {
    controller: AdmissionController,
    store: Arc<dyn MessageStore>,
    sender: Arc<dyn TransportSender>,
    config: DispatcherConfig,
    batch: VecDeque<PendingMessage>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// A `batch_size` of zero is raised to one.
    pub fn new(
        tiers: TierSet,
        store: Arc<dyn MessageStore>,
        sender: Arc<dyn TransportSender>,
        mut config: DispatcherConfig,
    ) -> Self {
        config.batch_size = config.batch_size.max(1);
        Self {
            controller: AdmissionController::new(tiers),
            store,
            sender,
            config,
            batch: VecDeque::new(),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Spawn the worker on the current tokio runtime.
    ///
    /// The per-tier timers start now. Dropping the returned handle without
    /// calling [`DispatcherHandle::stop`] also stops the worker.
    pub fn start(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(shutdown_rx));

        DispatcherHandle {
            shutdown: shutdown_tx,
            task,
            stats,
        }
    }

    /// Run the loop until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut timers = self.controller.timers();

        let primary = *self.controller.tiers().primary();
        tracing::info!(
            tiers = self.controller.tiers().len(),
            primary_period_ms = primary.period().as_millis() as u64,
            step = self.controller.tiers().step(),
            batch_size = self.config.batch_size,
            "SMS dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                tick = timers.next() => match tick {
                    TierTick::Primary => self.on_primary_tick().await,
                    TierTick::Secondary(tier) => self.controller.on_secondary_tick(tier),
                },
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            sent = stats.sent,
            failed = stats.failed,
            dropped_from_batch = self.batch.len(),
            "SMS dispatcher stopped"
        );
    }

    async fn on_primary_tick(&mut self) {
        if !self.controller.on_primary_tick() {
            DispatchStats::incr(&self.stats.throttled);
            return;
        }

        let Some(message) = self.next_message().await else {
            return;
        };

        let outcome = self.sender.send(&message.recipient, &message.body).await;
        self.controller.record_admission();
        self.record_outcome(&message, outcome).await;
    }

    /// Pop the head of the local batch, refilling it from the store if empty.
    async fn next_message(&mut self) -> Option<PendingMessage> {
        if self.batch.is_empty() {
            match self.store.fetch_pending(self.config.batch_size).await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        tracing::debug!(count = messages.len(), "Fetched pending SMS batch");
                    }
                    self.batch.extend(messages);
                }
                Err(e) => {
                    DispatchStats::incr(&self.stats.store_errors);
                    tracing::error!(
                        error = %e,
                        transient = e.is_transient(),
                        "Failed to fetch pending SMS"
                    );
                    return None;
                }
            }
        }

        self.batch.pop_front()
    }

    async fn record_outcome(&self, message: &PendingMessage, outcome: Result<(), SendError>) {
        let now = Utc::now();

        let result = match outcome {
            Ok(()) => {
                DispatchStats::incr(&self.stats.sent);
                tracing::info!(message_id = %message.id, "SMS sent");
                self.store.mark_sent(message.id, now).await
            }
            Err(e) => {
                DispatchStats::incr(&self.stats.failed);
                match self.config.policy.on_failure(message.attempts, now) {
                    FailureAction::MarkSent => {
                        tracing::warn!(
                            message_id = %message.id,
                            error = %e,
                            "SMS delivery failed, not retrying"
                        );
                        self.store.mark_sent(message.id, now).await
                    }
                    FailureAction::Retry { attempts, at } => {
                        tracing::warn!(
                            message_id = %message.id,
                            attempts,
                            retry_at = %at,
                            error = %e,
                            "SMS delivery failed, retry scheduled"
                        );
                        self.store
                            .mark_failed(message.id, attempts, &e.to_string(), Some(at))
                            .await
                    }
                    FailureAction::Abandon { attempts } => {
                        tracing::error!(
                            message_id = %message.id,
                            attempts,
                            error = %e,
                            "SMS delivery failed permanently"
                        );
                        self.store
                            .mark_failed(message.id, attempts, &e.to_string(), None)
                            .await
                    }
                }
            }
        };

        if let Err(e) = result {
            DispatchStats::incr(&self.stats.store_errors);
            tracing::error!(
                message_id = %message.id,
                error = %e,
                "Failed to persist SMS delivery outcome"
            );
        }
    }
}

/// Owner-side control of a running [`Dispatcher`].
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<DispatchStats>,
}

impl DispatcherHandle {
    /// Ask the worker to stop after its current tick.
    pub fn stop(&self) {
        // Only fails when the worker is already gone.
        let _ = self.shutdown.send(true);
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<StatsSnapshot, JoinError> {
        self.task.await?;
        Ok(self.stats.snapshot())
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) -> Result<StatsSnapshot, JoinError> {
        self.stop();
        self.join().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
