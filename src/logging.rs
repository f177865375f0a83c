//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and
//! files for debugging long-running drain loops and queue workers, plus
//! helpers for the log events the operational surface alerts on: lock
//! contention, lease loss, retry scheduling, and dead-letter transitions.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        if !log_dir.exists() {
            fs::create_dir_all(&log_dir).expect("Failed to create log directory");
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        // try_init so embedding applications that already installed a global
        // subscriber keep theirs
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            "🔧 STRUCTURED LOGGING: Initialized with file output"
        );

        // Keep the non-blocking writer alive for the process lifetime
        std::mem::forget(guard);
    });
}

fn get_environment() -> String {
    std::env::var("COURIER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a cursor-lock lifecycle event (claim, contention, lease loss, release)
pub fn log_cursor_lock_event(
    consumer_id: &str,
    operation: &str,
    status: &str,
    base_cursor: Option<i64>,
    details: Option<&str>,
) {
    tracing::info!(
        consumer_id = %consumer_id,
        operation = %operation,
        status = %status,
        base_cursor = base_cursor,
        details = details,
        "🔒 CURSOR_LOCK"
    );
}

/// Log a retry being scheduled for a consumer or message
pub fn log_retry_scheduled(
    subject: &str,
    retry_count: i32,
    not_before: chrono::DateTime<Utc>,
    error: &str,
) {
    tracing::warn!(
        subject = %subject,
        retry_count = retry_count,
        not_before = %not_before.to_rfc3339(),
        error = %error,
        "🔁 RETRY_SCHEDULED"
    );
}

/// Log a dead-letter transition, the primary alerting signal
pub fn log_dead_letter(subject: &str, id: i64, error: &str) {
    tracing::error!(
        subject = %subject,
        id = id,
        error = %error,
        "💀 DEAD_LETTER"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("COURIER_ENV", "test_override");
        assert_eq!(get_environment(), "test_override");
        std::env::remove_var("COURIER_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("test"), "debug");
    }
}
