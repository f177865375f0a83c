//! # Cursor Lock
//!
//! Per-consumer exclusive, time-leased processing slot. Serializes draining
//! across any number of worker processes through a single conditional row
//! update — no advisory locks, no transaction held open while the (possibly
//! slow) processing callback runs. While a drain is in flight the lease is
//! pushed forward by a background ticker; a worker that dies simply stops
//! renewing and the slot becomes claimable once the lease (plus a clock-
//! drift pad) expires.
//!
//! Claiming is a single round-trip that also enforces retry backoff: a
//! consumer inside its backoff window observes "no work done" without
//! touching the row. Lock contention is not an error — it is the normal
//! "someone else is working" signal.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::logging::{log_cursor_lock_event, log_dead_letter, log_retry_scheduled};
use crate::outbox::consumer::{OutboxProcessor, ProcessOutcome};
use crate::outbox::cursor::{compact, ProcessedSet};
use crate::outbox::dead_letter::DeadLetterStore;
use crate::outbox::events::EventLog;
use crate::ticker::Ticker;

#[derive(sqlx::FromRow)]
struct ClaimedState {
    base_cursor: i64,
    processed_set: Value,
    retry_count: i32,
}

/// Exclusive drain slot for one consumer
#[derive(Clone)]
pub struct CursorLock {
    pool: PgPool,
    consumer_id: String,
    config: OutboxConfig,
    event_log: EventLog,
    dead_letters: DeadLetterStore,
}

impl CursorLock {
    pub fn new(
        pool: PgPool,
        consumer_id: impl Into<String>,
        config: OutboxConfig,
        event_log: EventLog,
    ) -> Self {
        let dead_letters = DeadLetterStore::new(pool.clone());
        Self {
            pool,
            consumer_id: consumer_id.into(),
            config,
            event_log,
            dead_letters,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Claim the slot, drain available events through the processor, release.
    ///
    /// Returns whether any work was performed, which the caller uses to
    /// decide whether to re-trigger immediately. Never blocks on contention
    /// or backoff — both surface as `Ok(false)`.
    #[instrument(skip(self, processor), fields(consumer_id = %self.consumer_id))]
    pub async fn run(&self, processor: &dyn OutboxProcessor) -> Result<bool> {
        let owner = Uuid::new_v4();

        let Some(state) = self.claim(owner).await? else {
            debug!("Cursor lock not acquired (held elsewhere or in backoff)");
            return Ok(false);
        };

        log_cursor_lock_event(
            &self.consumer_id,
            "claim",
            "acquired",
            Some(state.base_cursor),
            None,
        );

        // Keep the lease fresh while the drain runs. The flag flips if a
        // refresh ever observes foreign ownership, so the drain stops
        // writing through a lock it no longer holds.
        let lease_lost = Arc::new(AtomicBool::new(false));
        let refresh = self.spawn_refresh(owner, Arc::clone(&lease_lost));

        let worked = self.drain(processor, owner, state, &lease_lost).await;

        // Stop the refresh ticker before clearing the lock, so a renewal
        // cannot race the release and resurrect a cleared lease
        refresh.stop().await;
        self.release(owner).await?;

        worked
    }

    /// Test-and-set claim combined with the backoff gate, one round-trip
    async fn claim(&self, owner: Uuid) -> Result<Option<ClaimedState>> {
        let state = sqlx::query_as::<_, ClaimedState>(
            r#"
            UPDATE courier_consumer_cursors
            SET lock_token = $2,
                lock_expires_at = now() + ($3::bigint * interval '1 second'),
                updated_at = now()
            WHERE consumer_id = $1
              AND (lock_token IS NULL
                   OR lock_expires_at + ($4::bigint * interval '1 millisecond') < now())
              AND (retry_not_before IS NULL OR retry_not_before <= now())
            RETURNING base_cursor, processed_set, retry_count
            "#,
        )
        .bind(&self.consumer_id)
        .bind(owner)
        .bind(self.config.lock_lease_seconds as i64)
        .bind(self.config.clock_drift_pad_ms as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    fn spawn_refresh(&self, owner: Uuid, lease_lost: Arc<AtomicBool>) -> Ticker {
        let pool = self.pool.clone();
        let consumer_id = self.consumer_id.clone();
        let lease_seconds = self.config.lock_lease_seconds as i64;
        let period = std::time::Duration::from_secs(self.config.lock_refresh_seconds);

        Ticker::spawn("cursor_lock_refresh", period, move || {
            let pool = pool.clone();
            let consumer_id = consumer_id.clone();
            let lease_lost = Arc::clone(&lease_lost);
            async move {
                let result = sqlx::query(
                    r#"
                    UPDATE courier_consumer_cursors
                    SET lock_expires_at = now() + ($3::bigint * interval '1 second')
                    WHERE consumer_id = $1 AND lock_token = $2
                    "#,
                )
                .bind(&consumer_id)
                .bind(owner)
                .bind(lease_seconds)
                .execute(&pool)
                .await;

                match result {
                    Ok(done) if done.rows_affected() == 0 => {
                        log_cursor_lock_event(&consumer_id, "refresh", "lease_lost", None, None);
                        lease_lost.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Transient; the lease holds for a full lease window
                        // and the next tick retries
                        warn!(consumer_id = %consumer_id, error = %e, "Lease refresh failed");
                    }
                }
            }
        })
    }

    async fn drain(
        &self,
        processor: &dyn OutboxProcessor,
        owner: Uuid,
        state: ClaimedState,
        lease_lost: &AtomicBool,
    ) -> Result<bool> {
        let mut base = state.base_cursor;
        let mut set = ProcessedSet::from_json(&state.processed_set)?;
        let mut retry_count = state.retry_count;
        let mut worked = false;

        loop {
            if lease_lost.load(Ordering::SeqCst) {
                warn!(consumer_id = %self.consumer_id, "Aborting drain: lease lost");
                break;
            }

            match processor.process(base, &set.ids()).await {
                ProcessOutcome::Processed(ids) => {
                    if ids.is_empty() {
                        error!(
                            consumer_id = %self.consumer_id,
                            "Processor reported progress with no ids; aborting cycle"
                        );
                        break;
                    }
                    let before = (base, set.clone());
                    base = compact(base, &mut set, &ids, Utc::now(), self.config.gap_window());
                    if (base, &set) == (before.0, &before.1) {
                        error!(
                            consumer_id = %self.consumer_id,
                            ids = ?ids,
                            "Processor reported already-recorded ids; aborting cycle"
                        );
                        break;
                    }
                    retry_count = 0;
                    worked = true;
                    if !self.persist_progress(owner, base, &set).await? {
                        warn!(consumer_id = %self.consumer_id, "Lease lost while persisting");
                        break;
                    }
                }
                ProcessOutcome::NoEvents => break,
                ProcessOutcome::Failed { error, processed } => {
                    if !processed.is_empty() {
                        base = compact(
                            base,
                            &mut set,
                            &processed,
                            Utc::now(),
                            self.config.gap_window(),
                        );
                        worked = true;
                    }
                    retry_count += 1;

                    if self.retries_exhausted(retry_count) {
                        self.quarantine_oldest(owner, &mut base, &mut set, &error)
                            .await?;
                        retry_count = 0;
                        // Cursor advanced past the poison event; keep
                        // draining the rest of the backlog
                        continue;
                    }

                    let not_before = Utc::now() + self.backoff_delay(retry_count);
                    log_retry_scheduled(&self.consumer_id, retry_count, not_before, &error);
                    if !self
                        .persist_failure(owner, base, &set, retry_count, &error, not_before)
                        .await?
                    {
                        warn!(
                            consumer_id = %self.consumer_id,
                            "Lease lost while persisting failure; backoff not recorded"
                        );
                    }
                    break;
                }
            }
        }

        Ok(worked)
    }

    /// Persist compacted progress; false means the lease is no longer ours
    async fn persist_progress(&self, owner: Uuid, base: i64, set: &ProcessedSet) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_consumer_cursors
            SET base_cursor = $3,
                processed_set = $4,
                retry_count = 0,
                retry_not_before = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE consumer_id = $1 AND lock_token = $2
            "#,
        )
        .bind(&self.consumer_id)
        .bind(owner)
        .bind(base)
        .bind(set.to_json())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// The ceiling counts failures: the Nth consecutive failure is the one
    /// that dead-letters, same as the queue side's failure ceiling
    fn retries_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.config.max_retries
    }

    /// Persist the failure record; false means the lease is no longer ours
    async fn persist_failure(
        &self,
        owner: Uuid,
        base: i64,
        set: &ProcessedSet,
        retry_count: i32,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_consumer_cursors
            SET base_cursor = $3,
                processed_set = $4,
                retry_count = $5,
                retry_not_before = $6,
                last_error = $7,
                updated_at = now()
            WHERE consumer_id = $1 AND lock_token = $2
            "#,
        )
        .bind(&self.consumer_id)
        .bind(owner)
        .bind(base)
        .bind(set.to_json())
        .bind(retry_count)
        .bind(not_before)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Move the single oldest unprocessed event to the dead-letter table and
    /// advance the cursor past exactly that id, atomically. Zero-window
    /// compaction: in the poison situation nothing else is pending, so the
    /// base lands exactly on the quarantined event.
    async fn quarantine_oldest(
        &self,
        owner: Uuid,
        base: &mut i64,
        set: &mut ProcessedSet,
        error: &str,
    ) -> Result<()> {
        let Some(event) = self.event_log.oldest_unprocessed(*base, &set.ids()).await? else {
            // Retries exhausted but nothing left to blame; the backlog
            // drained out from under the failure
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        self.dead_letters
            .insert_in_tx(&mut tx, &self.consumer_id, event.id, error)
            .await?;

        *base = compact(*base, set, &[event.id], Utc::now(), Duration::zero());

        let done = sqlx::query(
            r#"
            UPDATE courier_consumer_cursors
            SET base_cursor = $3,
                processed_set = $4,
                retry_count = 0,
                retry_not_before = NULL,
                last_error = $5,
                updated_at = now()
            WHERE consumer_id = $1 AND lock_token = $2
            "#,
        )
        .bind(&self.consumer_id)
        .bind(owner)
        .bind(*base)
        .bind(set.to_json())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() == 0 {
            tx.rollback().await?;
            warn!(consumer_id = %self.consumer_id, "Lease lost during dead-letter move");
            return Ok(());
        }

        tx.commit().await?;
        log_dead_letter(&self.consumer_id, event.id, error);
        Ok(())
    }

    async fn release(&self, owner: Uuid) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE courier_consumer_cursors
            SET lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE consumer_id = $1 AND lock_token = $2
            "#,
        )
        .bind(&self.consumer_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() > 0 {
            debug!(consumer_id = %self.consumer_id, "Cursor lock released");
        } else {
            // Expired and stolen mid-drain; the thief owns the slot now
            info!(consumer_id = %self.consumer_id, "Cursor lock already taken over at release");
        }
        Ok(())
    }

    /// Exponential backoff with cap and jitter (`base * 2^retries`)
    fn backoff_delay(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 20) as u32;
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        let jittered = (ms as f64 * (1.0 + fastrand::f64() * 0.1)) as u64;
        Duration::milliseconds(jittered.min(self.config.backoff_max_ms) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_with(base_ms: u64, max_ms: u64) -> CursorLock {
        let pool = PgPool::connect_lazy("postgresql://localhost/courier_test")
            .expect("lazy pool construction is offline");
        let config = OutboxConfig {
            backoff_base_ms: base_ms,
            backoff_max_ms: max_ms,
            ..OutboxConfig::default()
        };
        let event_log = EventLog::new(pool.clone(), "courier_events");
        CursorLock::new(pool, "broadcast", config, event_log)
    }

    #[tokio::test]
    async fn test_backoff_grows_exponentially() {
        let lock = lock_with(1_000, 600_000);
        let first = lock.backoff_delay(1).num_milliseconds();
        let third = lock.backoff_delay(3).num_milliseconds();
        // 1s*2^1=2s and 1s*2^3=8s, each with up to 10% jitter
        assert!((2_000..=2_200).contains(&first), "got {first}");
        assert!((8_000..=8_800).contains(&third), "got {third}");
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let lock = lock_with(1_000, 60_000);
        let delay = lock.backoff_delay(20).num_milliseconds();
        assert_eq!(delay, 60_000);
    }

    #[tokio::test]
    async fn test_nth_failure_is_the_one_that_dead_letters() {
        // Default ceiling is 5: failures 1-4 back off, failure 5 quarantines
        let lock = lock_with(1_000, 60_000);
        assert_eq!(lock.config.max_retries, 5);
        for retry_count in 1..5 {
            assert!(!lock.retries_exhausted(retry_count), "at {retry_count}");
        }
        assert!(lock.retries_exhausted(5));
        assert!(lock.retries_exhausted(6));
    }

    #[tokio::test]
    async fn test_backoff_tolerates_extreme_retry_counts() {
        let lock = lock_with(1_000, 60_000);
        assert_eq!(lock.backoff_delay(i32::MAX).num_milliseconds(), 60_000);
        assert!(lock.backoff_delay(0).num_milliseconds() >= 1_000);
    }
}
