//! # Retention Worker
//!
//! Watermark-based garbage collection for the event log. An event row is
//! deletable once every configured consumer's base cursor has passed it AND
//! it is older than the retention window. Deletion happens in bounded
//! batches so each transaction stays short, with at most a handful of
//! batches per run.
//!
//! Conservative by design: if any configured consumer id has no cursor row
//! yet, the whole run aborts — an unregistered consumer might later start
//! from zero and still need the old events.

use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::outbox::cursor::CursorStore;
use crate::ticker::Ticker;

pub struct RetentionWorker {
    pool: PgPool,
    config: RetentionConfig,
    ticker: Option<Ticker>,
}

impl RetentionWorker {
    pub fn new(pool: PgPool, config: RetentionConfig) -> Self {
        Self {
            pool,
            config,
            ticker: None,
        }
    }

    /// Start the periodic deletion passes
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let config = self.config.clone();
        info!(
            interval_seconds = config.interval_seconds,
            consumers = config.consumer_ids.len(),
            "🧹 Retention worker started"
        );
        self.ticker = Some(Ticker::spawn(
            "retention",
            Duration::from_secs(self.config.interval_seconds),
            move || {
                let pool = pool.clone();
                let config = config.clone();
                async move {
                    if let Err(e) = run_once(&pool, &config).await {
                        warn!(error = %e, "Retention pass failed");
                    }
                }
            },
        ));
    }

    pub async fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop().await;
            info!("Retention worker stopped");
        }
    }
}

/// One retention pass. Returns rows deleted; 0 also covers the conservative
/// aborts (missing consumer, empty consumer set).
pub async fn run_once(pool: &PgPool, config: &RetentionConfig) -> Result<u64> {
    let Some(watermark) = compute_watermark(pool, config).await? else {
        return Ok(0);
    };

    let mut total = 0u64;
    for _ in 0..config.max_batches {
        let deleted = sqlx::query(
            r#"
            DELETE FROM courier_events
            WHERE id IN (
                SELECT id FROM courier_events
                WHERE id <= $1
                  AND created_at < now() - ($2::bigint * interval '1 second')
                ORDER BY id
                LIMIT $3
            )
            "#,
        )
        .bind(watermark)
        .bind(config.window_seconds as i64)
        .bind(config.batch_size)
        .execute(pool)
        .await?
        .rows_affected();

        total += deleted;
        if deleted == 0 {
            break;
        }
    }

    if total > 0 {
        info!(watermark = watermark, deleted = total, "🧹 Retention deleted expired events");
    } else {
        debug!(watermark = watermark, "Retention pass found nothing to delete");
    }
    Ok(total)
}

/// Minimum base cursor across the configured consumers, or None when the
/// computation must abort
async fn compute_watermark(pool: &PgPool, config: &RetentionConfig) -> Result<Option<i64>> {
    if config.consumer_ids.is_empty() {
        warn!("Retention configured with no consumer ids; skipping");
        return Ok(None);
    }

    let store = CursorStore::new(pool.clone());
    let cursors = store.base_cursors(&config.consumer_ids).await?;
    match watermark_over(&config.consumer_ids, &cursors) {
        Ok(watermark) => Ok(watermark),
        Err(missing) => {
            warn!(
                missing = ?missing,
                "Retention aborted: configured consumers have no cursor row"
            );
            Ok(None)
        }
    }
}

/// Minimum base cursor across the configured consumers, or the ids that have
/// no cursor row. Any missing id aborts: a consumer that has not registered
/// yet may still need every event.
fn watermark_over<'a>(
    configured: &'a [String],
    cursors: &[(String, i64)],
) -> std::result::Result<Option<i64>, Vec<&'a str>> {
    let present: Vec<&str> = cursors.iter().map(|(id, _)| id.as_str()).collect();
    let missing: Vec<&str> = configured
        .iter()
        .map(String::as_str)
        .filter(|id| !present.contains(id))
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }
    Ok(cursors.iter().map(|(_, cursor)| *cursor).min())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_consumer_set_skips_without_touching_database() {
        // connect_lazy never dials out; reaching the database would error
        let pool = PgPool::connect_lazy("postgresql://localhost/courier_test").unwrap();
        let config = RetentionConfig {
            consumer_ids: Vec::new(),
            ..RetentionConfig::default()
        };
        assert_eq!(run_once(&pool, &config).await.unwrap(), 0);
    }

    #[test]
    fn test_missing_consumer_aborts_watermark() {
        let configured = vec!["broadcast".to_string(), "search-index".to_string()];
        let cursors = vec![("broadcast".to_string(), 120)];

        let missing = watermark_over(&configured, &cursors).unwrap_err();
        assert_eq!(missing, vec!["search-index"]);
    }

    #[test]
    fn test_watermark_is_slowest_cursor_when_all_present() {
        let configured = vec!["broadcast".to_string(), "search-index".to_string()];
        let cursors = vec![
            ("broadcast".to_string(), 120),
            ("search-index".to_string(), 45),
        ];

        assert_eq!(watermark_over(&configured, &cursors).unwrap(), Some(45));
    }
}
