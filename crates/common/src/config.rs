use std::time::Duration;

use serde::Deserialize;

/// Default tier configuration: one message per second, 20 per minute, 500 per day.
const DEFAULT_RATE_TIERS: &str = "1s=1,1m=20,24h=500";

/// How the dispatcher treats a message whose delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Mark the message sent regardless of the gateway's answer.
    BestEffort,
    /// Keep the message pending and retry it later with exponential backoff.
    Retry,
}

impl std::str::FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" => Ok(DeliveryMode::BestEffort),
            "retry" => Ok(DeliveryMode::Retry),
            other => Err(anyhow::anyhow!(
                "unknown delivery policy '{}', expected 'best_effort' or 'retry'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,

    /// Webhook URL of the SMS gateway
    pub sms_gateway_url: String,

    /// Unordered `(period, capacity)` pairs, e.g. `1s=1,1m=20,24h=500`
    pub sms_rate_tiers: Vec<(Duration, u32)>,

    /// Messages consumed from every secondary tier per send.
    /// `None` means "use the primary tier's capacity".
    pub sms_send_step: Option<u32>,

    /// Number of pending messages fetched per store round-trip (default: 100)
    pub sms_batch_size: usize,

    /// Upper bound on a single gateway request (default: 5000 ms)
    pub sms_send_timeout_ms: u64,

    /// Failure handling policy (default: best effort)
    pub sms_delivery_policy: DeliveryMode,

    /// Failed attempts before a message is abandoned, retry policy only (default: 5)
    pub sms_max_attempts: u32,

    /// First retry delay in milliseconds (default: 1000)
    pub sms_retry_base_ms: u64,

    /// Retry delay cap in milliseconds (default: 300000 = 5 min)
    pub sms_retry_max_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parse_u64 = |key: &str, default: &str| -> anyhow::Result<u64> {
            var(key)
                .unwrap_or_else(|| default.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a valid u64", key))
        };

        let sms_send_step = match var("SMS_SEND_STEP") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("SMS_SEND_STEP must be a valid u32"))?,
            ),
            None => None,
        };

        let tiers_raw = var("SMS_RATE_TIERS").unwrap_or_else(|| DEFAULT_RATE_TIERS.to_string());
        let sms_rate_tiers = parse_rate_tiers(&tiers_raw)
            .map_err(|e| anyhow::anyhow!("SMS_RATE_TIERS is invalid: {}", e))?;

        Ok(Self {
            database_url: var("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            sms_gateway_url: var("SMS_GATEWAY_URL").ok_or_else(|| {
                anyhow::anyhow!("SMS_GATEWAY_URL environment variable is required")
            })?,
            sms_rate_tiers,
            sms_send_step,
            sms_batch_size: var("SMS_BATCH_SIZE")
                .unwrap_or_else(|| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SMS_BATCH_SIZE must be a valid usize"))?,
            sms_send_timeout_ms: parse_u64("SMS_SEND_TIMEOUT_MS", "5000")?,
            sms_delivery_policy: var("SMS_DELIVERY_POLICY")
                .unwrap_or_else(|| "best_effort".to_string())
                .parse()?,
            sms_max_attempts: var("SMS_MAX_ATTEMPTS")
                .unwrap_or_else(|| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SMS_MAX_ATTEMPTS must be a valid u32"))?,
            sms_retry_base_ms: parse_u64("SMS_RETRY_BASE_MS", "1000")?,
            sms_retry_max_ms: parse_u64("SMS_RETRY_MAX_MS", "300000")?,
        })
    }
}

/// Parse a comma separated `period=capacity` list such as `1s=1,1m=20,24h=500`.
///
/// Order is preserved; sorting into primary and secondary tiers happens when the
/// tier set is built.
pub fn parse_rate_tiers(raw: &str) -> anyhow::Result<Vec<(Duration, u32)>> {
    let mut tiers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (period, capacity) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected 'period=capacity', got '{}'", entry))?;
        let period = parse_duration(period.trim())
            .ok_or_else(|| anyhow::anyhow!("bad duration '{}'", period.trim()))?;
        let capacity: u32 = capacity
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("bad capacity '{}'", capacity.trim()))?;
        tiers.push((period, capacity));
    }
    if tiers.is_empty() {
        anyhow::bail!("at least one rate tier is required");
    }
    Ok(tiers)
}

/// Parse a compound duration literal (`250ms`, `1s`, `1h30m`, `2d`).
pub fn parse_duration(literal: &str) -> Option<Duration> {
    let bytes = literal.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut idx = 0usize;
    while idx < bytes.len() {
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if start == idx {
            return None;
        }
        let value: u64 = literal[start..idx].parse().ok()?;
        let unit_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let part = match &literal[unit_start..idx] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3_600)?),
            "d" => Duration::from_secs(value.checked_mul(86_400)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}
