//! # Courier Configuration System
//!
//! Environment-aware configuration for the outbox and queue core. Every
//! knob has an explicit default tuned for a single-digit-worker deployment;
//! `from_env()` overrides individual values and fails loudly on unparseable
//! input rather than falling back silently.

use crate::error::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for all courier components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    pub database: DatabaseConfig,
    pub outbox: OutboxConfig,
    pub dispatcher: DispatcherConfig,
    pub queue: QueueConfig,
    pub cron: CronConfig,
    pub retention: RetentionConfig,
}

/// Database connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/courier_development".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 10,
        }
    }
}

/// Cursor-lock and event-log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Sliding-window tolerance for ids becoming visible out of commit order.
    /// A processed-set entry older than this is folded into the base cursor.
    pub gap_window_seconds: u64,
    /// How long a claimed cursor lock lives without renewal
    pub lock_lease_seconds: u64,
    /// Lease refresh period while a drain is running
    pub lock_refresh_seconds: u64,
    /// Pad added to lock expiry before another worker may steal it,
    /// absorbing clock drift between workers
    pub clock_drift_pad_ms: u64,
    /// Max events fetched per processing callback invocation
    pub fetch_batch_size: i64,
    /// Failure ceiling: the drain failure that reaches this count
    /// dead-letters the oldest unprocessed event
    pub max_retries: i32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            gap_window_seconds: 30,
            lock_lease_seconds: 60,
            lock_refresh_seconds: 20,
            clock_drift_pad_ms: 500,
            fetch_batch_size: 100,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl OutboxConfig {
    pub fn gap_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gap_window_seconds as i64)
    }
}

/// LISTEN/NOTIFY dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Postgres notification channel all event appends signal on
    pub channel: String,
    /// Fallback wake period covering missed/dropped notifications
    pub fallback_poll_seconds: u64,
    /// Silence duration after which the subscription is probed, and after
    /// two silent intervals considered dead
    pub keepalive_seconds: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Consumer wake debounce: quiet period before a drain fires
    pub wake_quiet_ms: u64,
    /// Consumer wake debounce: hard ceiling so constant traffic cannot
    /// starve the drain
    pub wake_max_wait_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel: "courier_events".to_string(),
            fallback_poll_seconds: 30,
            keepalive_seconds: 60,
            reconnect_base_ms: 250,
            reconnect_max_ms: 30_000,
            wake_quiet_ms: 25,
            wake_max_wait_ms: 500,
        }
    }
}

/// Job queue manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Sleep between polling cycles once a cycle finds no claimable tokens
    pub poll_interval_ms: u64,
    /// Debounce before refilling a token slot after its work completes
    pub refill_debounce_ms: u64,
    /// Max work tokens (distinct workspaces) leased per polling cycle
    pub max_tokens_per_cycle: i64,
    /// Messages claimed per leased token in one batched claim
    pub claim_batch_size: i64,
    /// How long a message claim and a work token live without renewal
    pub claim_lease_seconds: u64,
    /// Renewal period for in-flight claims (whole batch at once)
    pub renewal_interval_seconds: u64,
    /// Bounded concurrency for handler execution within one process
    pub handler_concurrency: usize,
    /// Failures before a message is dead-lettered
    pub max_failures: i32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Hard ceiling on waiting for in-flight work during shutdown
    pub shutdown_grace_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            refill_debounce_ms: 50,
            max_tokens_per_cycle: 4,
            claim_batch_size: 20,
            claim_lease_seconds: 60,
            renewal_interval_seconds: 20,
            handler_concurrency: 10,
            max_failures: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Recurring-schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// How often future ticks are materialized
    pub materialize_interval_seconds: u64,
    /// How far ahead ticks are materialized
    pub lookahead_seconds: u64,
    /// Lease on a due tick while it is converted into a queue message
    pub tick_lease_seconds: u64,
    /// Due ticks converted per materializer pass
    pub tick_batch_size: i64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            materialize_interval_seconds: 30,
            lookahead_seconds: 300,
            tick_lease_seconds: 30,
            tick_batch_size: 50,
        }
    }
}

/// Event-log retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub interval_seconds: u64,
    /// Events younger than this survive even below the watermark
    pub window_seconds: u64,
    pub batch_size: i64,
    /// Deletion batches per run, keeping each run's transactions short
    pub max_batches: u32,
    /// Consumer ids whose cursors gate deletion. A missing cursor row for
    /// any of these aborts the run.
    pub consumer_ids: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            window_seconds: 86_400,
            batch_size: 1_000,
            max_batches: 10,
            consumer_ids: Vec::new(),
        }
    }
}

impl CourierConfig {
    /// Load configuration from environment variables, starting from defaults.
    ///
    /// Only a curated set of knobs is env-tunable; the rest are code-level
    /// defaults adjusted by constructing the struct directly.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(v) = std::env::var("COURIER_MAX_CONNECTIONS") {
            config.database.max_connections = parse_env("COURIER_MAX_CONNECTIONS", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_GAP_WINDOW_SECONDS") {
            config.outbox.gap_window_seconds = parse_env("COURIER_GAP_WINDOW_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_LOCK_LEASE_SECONDS") {
            config.outbox.lock_lease_seconds = parse_env("COURIER_LOCK_LEASE_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_QUEUE_POLL_INTERVAL_MS") {
            config.queue.poll_interval_ms = parse_env("COURIER_QUEUE_POLL_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_HANDLER_CONCURRENCY") {
            config.queue.handler_concurrency = parse_env("COURIER_HANDLER_CONCURRENCY", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_RETENTION_WINDOW_SECONDS") {
            config.retention.window_seconds = parse_env("COURIER_RETENTION_WINDOW_SECONDS", &v)?;
        }
        if let Ok(v) = std::env::var("COURIER_RETENTION_CONSUMERS") {
            config.retention.consumer_ids = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(CourierError::configuration(
                "database",
                "max_connections must be at least 1",
            ));
        }
        if self.outbox.lock_refresh_seconds >= self.outbox.lock_lease_seconds {
            return Err(CourierError::configuration(
                "outbox",
                "lock_refresh_seconds must be shorter than lock_lease_seconds",
            ));
        }
        if self.outbox.fetch_batch_size <= 0 {
            return Err(CourierError::configuration(
                "outbox",
                "fetch_batch_size must be positive",
            ));
        }
        if self.queue.renewal_interval_seconds >= self.queue.claim_lease_seconds {
            return Err(CourierError::configuration(
                "queue",
                "renewal_interval_seconds must be shorter than claim_lease_seconds",
            ));
        }
        if self.queue.max_tokens_per_cycle <= 0 || self.queue.claim_batch_size <= 0 {
            return Err(CourierError::configuration(
                "queue",
                "max_tokens_per_cycle and claim_batch_size must be positive",
            ));
        }
        if self.queue.handler_concurrency == 0 {
            return Err(CourierError::configuration(
                "queue",
                "handler_concurrency must be at least 1",
            ));
        }
        if self.dispatcher.channel.is_empty() {
            return Err(CourierError::configuration(
                "dispatcher",
                "channel must not be empty",
            ));
        }
        if self.dispatcher.wake_quiet_ms > self.dispatcher.wake_max_wait_ms {
            return Err(CourierError::configuration(
                "dispatcher",
                "wake_quiet_ms must not exceed wake_max_wait_ms",
            ));
        }
        if self.cron.lookahead_seconds == 0 {
            return Err(CourierError::configuration(
                "cron",
                "lookahead_seconds must be positive",
            ));
        }
        if self.retention.batch_size <= 0 || self.retention.max_batches == 0 {
            return Err(CourierError::configuration(
                "retention",
                "batch_size and max_batches must be positive",
            ));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        CourierError::configuration("env", format!("Invalid {name}={value}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CourierConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refresh_must_undercut_lease() {
        let mut config = CourierConfig::default();
        config.outbox.lock_refresh_seconds = config.outbox.lock_lease_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renewal_must_undercut_claim_lease() {
        let mut config = CourierConfig::default();
        config.queue.renewal_interval_seconds = config.queue.claim_lease_seconds + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debounce_quiet_bounded_by_ceiling() {
        let mut config = CourierConfig::default();
        config.dispatcher.wake_quiet_ms = config.dispatcher.wake_max_wait_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_parsing() {
        std::env::set_var("COURIER_GAP_WINDOW_SECONDS", "45");
        let config = CourierConfig::from_env().unwrap();
        assert_eq!(config.outbox.gap_window_seconds, 45);
        std::env::remove_var("COURIER_GAP_WINDOW_SECONDS");
    }

    #[test]
    fn test_retention_consumer_list_parsing() {
        std::env::set_var("COURIER_RETENTION_CONSUMERS", "broadcast, search-index,");
        let config = CourierConfig::from_env().unwrap();
        assert_eq!(
            config.retention.consumer_ids,
            vec!["broadcast".to_string(), "search-index".to_string()]
        );
        std::env::remove_var("COURIER_RETENTION_CONSUMERS");
    }
}
