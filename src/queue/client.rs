//! # Queue Client
//!
//! Producer-side surface: enqueue messages, optionally deduplicated, and
//! register recurring schedules. `send` can also run inside a caller's
//! transaction so enqueueing commits atomically with domain writes — the
//! same transactional pattern the event log uses for appends.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::error::{CourierError, Result};

// Matches the dedupe_key column width
const MAX_DEDUPE_KEY_LEN: usize = 128;

/// Options for a single enqueue
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Earliest processing time; `None` means immediately
    pub process_after: Option<DateTime<Utc>>,
    /// Producer-supplied idempotency key, unique per queue. A duplicate
    /// send returns the original message id.
    pub dedupe_key: Option<String>,
}

impl SendOptions {
    pub fn delayed(process_after: DateTime<Utc>) -> Self {
        Self {
            process_after: Some(process_after),
            ..Self::default()
        }
    }

    pub fn deduplicated(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Producer handle for the tenant-sharded job queue
#[derive(Debug, Clone)]
pub struct QueueClient {
    pool: PgPool,
}

impl QueueClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a message. Returns the message id — the original one when a
    /// dedupe key collides with a live message already in the queue.
    pub async fn send(
        &self,
        queue_name: &str,
        workspace_id: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = self
            .send_in_tx(&mut tx, queue_name, workspace_id, payload, options)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Enqueue within an existing transaction. The message only becomes
    /// visible to workers when the caller commits.
    pub async fn send_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        workspace_id: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<i64> {
        if let Some(key) = options.dedupe_key.as_deref() {
            validate_dedupe_key(key)?;
        }
        let process_after = options.process_after.unwrap_or_else(Utc::now);

        // Token rows are created lazily on first send, never deleted: an
        // empty (queue, workspace) pair simply never wins a lease.
        sqlx::query(
            r#"
            INSERT INTO courier_work_tokens (queue_name, workspace_id)
            VALUES ($1, $2)
            ON CONFLICT (queue_name, workspace_id) DO NOTHING
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id)
        .execute(&mut **tx)
        .await?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO courier_queue_messages
                (queue_name, workspace_id, payload, dedupe_key, process_after)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (queue_name, dedupe_key) WHERE dedupe_key IS NOT NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id)
        .bind(&payload)
        .bind(options.dedupe_key.as_deref())
        .bind(process_after)
        .fetch_optional(&mut **tx)
        .await?;

        let id = match inserted {
            Some((id,)) => {
                debug!(
                    queue_name,
                    workspace_id,
                    message_id = id,
                    "📤 Message enqueued"
                );
                id
            }
            None => {
                // Only reachable with a dedupe key; surface the winner's id
                let key = options.dedupe_key.as_deref().unwrap_or_default();
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    SELECT id FROM courier_queue_messages
                    WHERE queue_name = $1 AND dedupe_key = $2
                    "#,
                )
                .bind(queue_name)
                .bind(key)
                .fetch_one(&mut **tx)
                .await?;
                debug!(
                    queue_name,
                    message_id = id,
                    dedupe_key = key,
                    "Duplicate send folded into existing message"
                );
                id
            }
        };

        Ok(id)
    }

    /// Upsert a recurring schedule for a queue. `workspace_id = None`
    /// registers a global schedule whose ticks carry the empty workspace.
    pub async fn schedule(
        &self,
        queue_name: &str,
        workspace_id: Option<&str>,
        interval_seconds: i64,
        payload: Value,
    ) -> Result<i64> {
        if interval_seconds <= 0 {
            return Err(CourierError::queue_operation(
                queue_name,
                "schedule",
                "interval_seconds must be positive",
            ));
        }

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO courier_cron_schedules
                (queue_name, workspace_id, interval_seconds, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (queue_name, workspace_id)
            DO UPDATE SET interval_seconds = EXCLUDED.interval_seconds,
                          payload = EXCLUDED.payload,
                          updated_at = now()
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id.unwrap_or(""))
        .bind(interval_seconds)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        info!(
            queue_name,
            workspace_id = workspace_id.unwrap_or("<global>"),
            interval_seconds,
            schedule_id = id,
            "📋 Recurring schedule registered"
        );
        Ok(id)
    }

    /// Remove a recurring schedule and its unconverted ticks
    pub async fn unschedule(&self, queue_name: &str, workspace_id: Option<&str>) -> Result<bool> {
        let done = sqlx::query(
            r#"
            DELETE FROM courier_cron_schedules
            WHERE queue_name = $1 AND workspace_id = $2
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id.unwrap_or(""))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

fn validate_dedupe_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CourierError::InvalidDedupeKey {
            reason: "key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_DEDUPE_KEY_LEN {
        return Err(CourierError::InvalidDedupeKey {
            reason: format!("key exceeds {MAX_DEDUPE_KEY_LEN} bytes"),
        });
    }
    if key.chars().any(char::is_whitespace) {
        return Err(CourierError::InvalidDedupeKey {
            reason: "key must not contain whitespace".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_key_validation() {
        assert!(validate_dedupe_key("cron:42:1735689600").is_ok());
        assert!(validate_dedupe_key("user-7/welcome-email").is_ok());

        assert!(validate_dedupe_key("").is_err());
        assert!(validate_dedupe_key("has space").is_err());
        assert!(validate_dedupe_key(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_send_options_builders() {
        let when = Utc::now() + chrono::Duration::minutes(5);
        let delayed = SendOptions::delayed(when);
        assert_eq!(delayed.process_after, Some(when));
        assert!(delayed.dedupe_key.is_none());

        let deduped = SendOptions::deduplicated("digest:acme:2026-08-30");
        assert_eq!(deduped.dedupe_key.as_deref(), Some("digest:acme:2026-08-30"));
        assert!(deduped.process_after.is_none());
    }
}
