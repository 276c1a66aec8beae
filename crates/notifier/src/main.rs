use std::sync::Arc;
use std::time::Duration;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_limiter::TierSet;
use courier_notifier::dispatch::{Dispatcher, DispatcherConfig};
use courier_notifier::sender::WebhookSender;
use courier_notifier::store::PgMessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_limiter=debug".into()),
        )
        .json()
        .init();

    tracing::info!("Courier notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Validate rate tiers before touching the database
    let mut tiers = TierSet::from_pairs(&config.sms_rate_tiers)?;
    if let Some(step) = config.sms_send_step {
        tiers = tiers.with_step(step)?;
    }
    for (index, tier) in tiers.tiers().iter().enumerate() {
        tracing::info!(
            tier = index,
            period_ms = tier.period().as_millis() as u64,
            capacity = tier.capacity(),
            "Rate tier configured"
        );
    }

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    let store = PgMessageStore::new(pool);
    store.migrate().await?;

    // One HTTP client for the lifetime of the process
    let client = WebhookSender::build_client(Duration::from_millis(config.sms_send_timeout_ms))?;
    let sender = WebhookSender::new(client, config.sms_gateway_url.clone());

    let dispatcher = Dispatcher::new(
        tiers,
        Arc::new(store),
        Arc::new(sender),
        DispatcherConfig::from_app_config(&config),
    );
    let handle = dispatcher.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    let stats = handle.shutdown().await?;
    tracing::info!(
        sent = stats.sent,
        failed = stats.failed,
        throttled = stats.throttled,
        store_errors = stats.store_errors,
        "Courier notifier stopped."
    );
    Ok(())
}
