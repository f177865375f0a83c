//! # Recurring Schedules
//!
//! Cron-style enqueueing built from the same primitives as the rest of the
//! queue: rows, leases, and conditional updates. Two phases, both safe to
//! run on every worker concurrently:
//!
//! 1. **Materialize** — each schedule's upcoming ticks are written into a
//!    tick table ahead of time, deduplicated by `(schedule_id, run_at)`.
//!    Racing materializers insert the same ticks and conflict away.
//! 2. **Convert** — due ticks are leased with `FOR UPDATE SKIP LOCKED`,
//!    then each becomes a queue message and is deleted in one transaction.
//!    The message carries a dedupe key derived from the tick identity, so
//!    a crash between insert and delete cannot double-enqueue on retry.
//!
//! Missed runs are skipped, not back-filled: a schedule that was behind
//! fires once and resumes its cadence from now.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CronConfig;
use crate::error::Result;
use crate::queue::client::{QueueClient, SendOptions};
use crate::ticker::Ticker;

/// One row of `courier_cron_schedules`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CronSchedule {
    pub id: i64,
    pub queue_name: String,
    pub workspace_id: String,
    pub interval_seconds: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct LeasedTick {
    id: i64,
    schedule_id: i64,
    run_at: DateTime<Utc>,
}

/// Background worker materializing and converting cron ticks
pub struct CronWorker {
    pool: PgPool,
    config: CronConfig,
    worker_id: Uuid,
    ticker: Option<Ticker>,
}

impl CronWorker {
    pub fn new(pool: PgPool, config: CronConfig) -> Self {
        Self {
            pool,
            config,
            worker_id: Uuid::new_v4(),
            ticker: None,
        }
    }

    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let config = self.config.clone();
        let worker_id = self.worker_id;
        info!(
            interval_seconds = config.materialize_interval_seconds,
            lookahead_seconds = config.lookahead_seconds,
            "🚀 Cron worker started"
        );
        self.ticker = Some(Ticker::spawn(
            "cron",
            Duration::from_secs(self.config.materialize_interval_seconds),
            move || {
                let pool = pool.clone();
                let config = config.clone();
                async move {
                    if let Err(e) = run_once(&pool, &config, worker_id).await {
                        warn!(error = %e, "Cron pass failed");
                    }
                }
            },
        ));
    }

    pub async fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop().await;
            info!("Cron worker stopped");
        }
    }
}

/// One cron pass: materialize upcoming ticks, then convert due ones.
/// Returns messages enqueued.
pub async fn run_once(pool: &PgPool, config: &CronConfig, worker_id: Uuid) -> Result<u64> {
    materialize(pool, config).await?;
    convert_due(pool, config, worker_id).await
}

async fn materialize(pool: &PgPool, config: &CronConfig) -> Result<()> {
    let schedules =
        sqlx::query_as::<_, CronSchedule>("SELECT * FROM courier_cron_schedules").fetch_all(pool);
    let now = Utc::now();
    let lookahead = ChronoDuration::seconds(config.lookahead_seconds as i64);

    for schedule in schedules.await? {
        let (last_run,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT max(run_at) FROM courier_cron_ticks WHERE schedule_id = $1")
                .bind(schedule.id)
                .fetch_one(pool)
                .await?;

        let interval = ChronoDuration::seconds(schedule.interval_seconds);
        let upcoming = upcoming_ticks(last_run, interval, now, lookahead);
        if upcoming.is_empty() {
            continue;
        }

        for run_at in &upcoming {
            sqlx::query(
                r#"
                INSERT INTO courier_cron_ticks (schedule_id, run_at)
                VALUES ($1, $2)
                ON CONFLICT (schedule_id, run_at) DO NOTHING
                "#,
            )
            .bind(schedule.id)
            .bind(run_at)
            .execute(pool)
            .await?;
        }
        debug!(
            schedule_id = schedule.id,
            queue_name = %schedule.queue_name,
            ticks = upcoming.len(),
            "Materialized cron ticks"
        );
    }
    Ok(())
}

async fn convert_due(pool: &PgPool, config: &CronConfig, worker_id: Uuid) -> Result<u64> {
    let leased = sqlx::query_as::<_, LeasedTick>(
        r#"
        WITH due AS (
            SELECT id FROM courier_cron_ticks
            WHERE run_at <= now()
              AND (leased_by IS NULL OR lease_expires_at < now())
            ORDER BY run_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE courier_cron_ticks t
        SET leased_by = $1,
            lease_expires_at = now() + ($3::bigint * interval '1 second')
        FROM due
        WHERE t.id = due.id
        RETURNING t.id, t.schedule_id, t.run_at
        "#,
    )
    .bind(worker_id)
    .bind(config.tick_batch_size)
    .bind(config.tick_lease_seconds as i64)
    .fetch_all(pool)
    .await?;

    if leased.is_empty() {
        return Ok(0);
    }

    let client = QueueClient::new(pool.clone());
    let mut enqueued = 0u64;

    for tick in leased {
        let schedule = sqlx::query_as::<_, CronSchedule>(
            "SELECT * FROM courier_cron_schedules WHERE id = $1",
        )
        .bind(tick.schedule_id)
        .fetch_optional(pool)
        .await?;
        // Ticks cascade-delete with their schedule, so a miss here means
        // the schedule went away between lease and conversion
        let Some(schedule) = schedule else {
            continue;
        };

        let mut tx = pool.begin().await?;
        client
            .send_in_tx(
                &mut tx,
                &schedule.queue_name,
                &schedule.workspace_id,
                schedule.payload.clone(),
                SendOptions::deduplicated(tick_dedupe_key(tick.schedule_id, tick.run_at)),
            )
            .await?;
        sqlx::query("DELETE FROM courier_cron_ticks WHERE id = $1 AND leased_by = $2")
            .bind(tick.id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        enqueued += 1;
    }

    info!(enqueued, "📋 Cron ticks converted to messages");
    Ok(enqueued)
}

/// Dedupe key tying a message to the tick that produced it. A retried
/// conversion of the same tick folds into the already-enqueued message.
fn tick_dedupe_key(schedule_id: i64, run_at: DateTime<Utc>) -> String {
    format!("cron:{schedule_id}:{}", run_at.timestamp())
}

/// Run times to materialize: one interval past the last tick (or past now
/// for a fresh schedule), skipping missed runs, up to the lookahead horizon
fn upcoming_ticks(
    last_run: Option<DateTime<Utc>>,
    interval: ChronoDuration,
    now: DateTime<Utc>,
    lookahead: ChronoDuration,
) -> Vec<DateTime<Utc>> {
    if interval <= ChronoDuration::zero() {
        return Vec::new();
    }

    let anchor = last_run.unwrap_or(now);
    let mut next = anchor + interval;
    // Behind schedule: advance whole intervals so only one catch-up fires
    while next < now {
        next += interval;
    }

    let horizon = now + lookahead;
    let mut ticks = Vec::new();
    while next <= horizon {
        ticks.push(next);
        next += interval;
    }
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2026-08-30T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_fresh_schedule_starts_one_interval_out() {
        let now = t0();
        let ticks = upcoming_ticks(
            None,
            ChronoDuration::seconds(60),
            now,
            ChronoDuration::seconds(300),
        );
        assert_eq!(ticks.len(), 5);
        assert_eq!(ticks[0], now + ChronoDuration::seconds(60));
        assert_eq!(ticks[4], now + ChronoDuration::seconds(300));
    }

    #[test]
    fn test_behind_schedule_skips_missed_runs() {
        let now = t0();
        // Last tick an hour ago on a 60s cadence: no backfill burst
        let ticks = upcoming_ticks(
            Some(now - ChronoDuration::hours(1)),
            ChronoDuration::seconds(60),
            now,
            ChronoDuration::seconds(120),
        );
        assert_eq!(ticks, vec![now, now + ChronoDuration::seconds(60), now + ChronoDuration::seconds(120)]);
    }

    #[test]
    fn test_caught_up_schedule_extends_from_last_tick() {
        let now = t0();
        let ticks = upcoming_ticks(
            Some(now + ChronoDuration::seconds(240)),
            ChronoDuration::seconds(60),
            now,
            ChronoDuration::seconds(300),
        );
        assert_eq!(ticks, vec![now + ChronoDuration::seconds(300)]);
    }

    #[test]
    fn test_fully_materialized_schedule_adds_nothing() {
        let now = t0();
        let ticks = upcoming_ticks(
            Some(now + ChronoDuration::seconds(300)),
            ChronoDuration::seconds(60),
            now,
            ChronoDuration::seconds(300),
        );
        assert!(ticks.is_empty());
    }

    #[test]
    fn test_interval_longer_than_lookahead() {
        let now = t0();
        let ticks = upcoming_ticks(
            None,
            ChronoDuration::seconds(3_600),
            now,
            ChronoDuration::seconds(300),
        );
        assert!(ticks.is_empty());
    }

    #[test]
    fn test_tick_dedupe_key_is_stable() {
        let run_at = t0();
        assert_eq!(
            tick_dedupe_key(42, run_at),
            format!("cron:42:{}", run_at.timestamp())
        );
        // Same tick always maps to the same key
        assert_eq!(tick_dedupe_key(42, run_at), tick_dedupe_key(42, run_at));
    }
}
