//! Operational snapshot across the outbox and queue tables, cheap enough to
//! serve from a health endpoint. Everything is a point-in-time count; no
//! locks are taken.

use serde::Serialize;
use sqlx::PgPool;

use crate::config::CronConfig;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Consumers currently holding an unexpired cursor lock
    pub active_cursor_locks: i64,
    /// Consumers with a retry scheduled in the future
    pub consumers_backing_off: i64,
    /// Work tokens under an unexpired lease
    pub active_work_tokens: i64,
    /// Messages claimable right now
    pub ready_messages: i64,
    /// Messages under an unexpired claim
    pub claimed_messages: i64,
    pub dead_lettered_messages: i64,
    pub dead_lettered_events: i64,
    /// Cron ticks overdue by more than the conversion cadence. A tick that
    /// came due since the last materializer pass is latency, not a stall.
    pub stalled_cron_ticks: i64,
    pub pool_size: u32,
    pub pool_idle: usize,
}

impl HealthSnapshot {
    /// Nothing is stuck: no dead letters and no stalled ticks
    pub fn is_healthy(&self) -> bool {
        self.dead_lettered_messages == 0
            && self.dead_lettered_events == 0
            && self.stalled_cron_ticks == 0
    }
}

/// Gather a snapshot in one round trip. The cron config supplies the
/// materializer cadence, which bounds how long a due tick may sit
/// unconverted on a healthy system.
pub async fn snapshot(pool: &PgPool, cron: &CronConfig) -> Result<HealthSnapshot> {
    let row: (i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT count(*) FROM courier_consumer_cursors
             WHERE lock_token IS NOT NULL AND lock_expires_at > now()),
            (SELECT count(*) FROM courier_consumer_cursors
             WHERE retry_not_before > now()),
            (SELECT count(*) FROM courier_work_tokens
             WHERE leased_by IS NOT NULL AND lease_expires_at > now()),
            (SELECT count(*) FROM courier_queue_messages
             WHERE completed_at IS NULL AND dead_lettered_at IS NULL
               AND process_after <= now()
               AND (claimed_by IS NULL OR claim_expires_at < now())),
            (SELECT count(*) FROM courier_queue_messages
             WHERE completed_at IS NULL AND dead_lettered_at IS NULL
               AND claimed_by IS NOT NULL AND claim_expires_at > now()),
            (SELECT count(*) FROM courier_queue_messages
             WHERE dead_lettered_at IS NOT NULL),
            (SELECT count(*) FROM courier_dead_letters),
            (SELECT count(*) FROM courier_cron_ticks
             WHERE run_at <= now() - ($1::bigint * interval '1 second'))
        "#,
    )
    .bind(stall_grace_seconds(cron))
    .fetch_one(pool)
    .await?;

    Ok(HealthSnapshot {
        active_cursor_locks: row.0,
        consumers_backing_off: row.1,
        active_work_tokens: row.2,
        ready_messages: row.3,
        claimed_messages: row.4,
        dead_lettered_messages: row.5,
        dead_lettered_events: row.6,
        stalled_cron_ticks: row.7,
        pool_size: pool.size(),
        pool_idle: pool.num_idle(),
    })
}

/// A due tick may wait up to one full materializer period plus the pass
/// itself before conversion; only ticks older than that indicate a stall
fn stall_grace_seconds(cron: &CronConfig) -> i64 {
    (cron.materialize_interval_seconds as i64) * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> HealthSnapshot {
        HealthSnapshot {
            active_cursor_locks: 0,
            consumers_backing_off: 0,
            active_work_tokens: 0,
            ready_messages: 0,
            claimed_messages: 0,
            dead_lettered_messages: 0,
            dead_lettered_events: 0,
            stalled_cron_ticks: 0,
            pool_size: 0,
            pool_idle: 0,
        }
    }

    #[test]
    fn test_healthy_when_nothing_is_stuck() {
        assert!(empty().is_healthy());

        let busy = HealthSnapshot {
            ready_messages: 500,
            claimed_messages: 40,
            active_work_tokens: 4,
            ..empty()
        };
        // Backlog alone is load, not sickness
        assert!(busy.is_healthy());
    }

    #[test]
    fn test_dead_letters_flag_unhealthy() {
        let snapshot = HealthSnapshot {
            dead_lettered_messages: 1,
            ..empty()
        };
        assert!(!snapshot.is_healthy());

        let snapshot = HealthSnapshot {
            stalled_cron_ticks: 3,
            ..empty()
        };
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn test_stall_grace_covers_the_conversion_cadence() {
        let cron = CronConfig::default();
        assert_eq!(cron.materialize_interval_seconds, 30);
        assert_eq!(stall_grace_seconds(&cron), 60);

        let fast = CronConfig {
            materialize_interval_seconds: 5,
            ..CronConfig::default()
        };
        assert_eq!(stall_grace_seconds(&fast), 10);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(empty()).unwrap();
        assert_eq!(json["ready_messages"], 0);
        assert!(json.get("active_cursor_locks").is_some());
    }
}
