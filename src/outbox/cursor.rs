//! # Consumer Cursor State
//!
//! Per-consumer bookkeeping: the contiguous base cursor, the sliding-window
//! processed-set that absorbs commit-order reordering, and the pure
//! compaction function that folds the set back into the cursor.
//!
//! The reordering problem in one picture: events A (id=10) and B (id=11) are
//! inserted by concurrent transactions; B commits first, is fetched and
//! processed; A commits a moment later. Advancing the cursor to "max id
//! seen" would skip A forever. Instead, 11 parks in the processed-set until
//! either 10 shows up (contiguous fold) or the gap window expires (10's
//! transaction is presumed aborted and its sequence allocation skipped).

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CourierError, Result};

/// Ordered map of event id -> processed-at timestamp, for ids newer than the
/// base cursor. Typed in memory; converted to a JSONB string-keyed map only
/// at the storage boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedSet(BTreeMap<i64, DateTime<Utc>>);

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i64, at: DateTime<Utc>) {
        self.0.insert(id, at);
    }

    pub fn contains(&self, id: i64) -> bool {
        self.0.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i64> {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the JSONB storage shape (`{"11": "2026-01-01T00:00:00Z"}`)
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut set = BTreeMap::new();
        let Some(map) = value.as_object() else {
            return Err(CourierError::Internal(format!(
                "processed_set is not a JSON object: {value}"
            )));
        };
        for (key, raw) in map {
            let id: i64 = key.parse().map_err(|_| {
                CourierError::Internal(format!("processed_set key is not an id: {key}"))
            })?;
            let at: DateTime<Utc> = raw
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    CourierError::Internal(format!("processed_set timestamp invalid: {raw}"))
                })?;
            set.insert(id, at);
        }
        Ok(Self(set))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(id, at)| (id.to_string(), Value::String(at.to_rfc3339())))
                .collect(),
        )
    }

    fn max_safe(&self, now: DateTime<Utc>, gap_window: Duration) -> Option<i64> {
        self.0
            .iter()
            .filter(|(_, at)| now.signed_duration_since(**at) > gap_window)
            .map(|(id, _)| *id)
            .max()
    }
}

/// Fold newly processed ids into the processed-set and advance the base
/// cursor as far as is safe. Pure and idempotent: re-running with no new ids
/// changes nothing.
///
/// Steps, in order:
/// 1. merge `newly_processed` (ids above the base) stamped at `now`;
/// 2. advance the base to the maximum entry strictly older than the gap
///    window, never below the current base — a gap that stayed open for the
///    whole window belongs to a transaction that never committed;
/// 3. fold contiguous entries `base+1, base+2, …` immediately, regardless
///    of age;
/// 4. drop entries at or below the new base.
///
/// With `gap_window` zero every entry is safe, which is how dead-letter
/// advancement jumps past exactly the quarantined event.
pub fn compact(
    base_cursor: i64,
    set: &mut ProcessedSet,
    newly_processed: &[i64],
    now: DateTime<Utc>,
    gap_window: Duration,
) -> i64 {
    for &id in newly_processed {
        if id > base_cursor {
            set.insert(id, now);
        }
    }

    let mut base = base_cursor;
    // Zero window means every entry is safe, including ones stamped this
    // instant; the strictly-older test would hold them back
    let safe = if gap_window <= Duration::zero() {
        set.0.keys().max().copied()
    } else {
        set.max_safe(now, gap_window)
    };
    if let Some(safe) = safe {
        base = base.max(safe);
    }
    while set.contains(base + 1) {
        base += 1;
    }
    set.0.retain(|&id, _| id > base);
    base
}

/// One row of `courier_consumer_cursors`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsumerCursor {
    pub consumer_id: String,
    pub base_cursor: i64,
    pub processed_set: Value,
    pub retry_count: i32,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Queries over the cursor table that do not involve the lock lifecycle
#[derive(Debug, Clone)]
pub struct CursorStore {
    pool: PgPool,
}

impl CursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotently create the cursor row for a consumer, starting at
    /// `start_cursor` (typically the latest known event id, so a newly
    /// registered consumer does not replay all history).
    pub async fn ensure(&self, consumer_id: &str, start_cursor: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO courier_consumer_cursors (consumer_id, base_cursor)
            VALUES ($1, $2)
            ON CONFLICT (consumer_id) DO NOTHING
            "#,
        )
        .bind(consumer_id)
        .bind(start_cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, consumer_id: &str) -> Result<Option<ConsumerCursor>> {
        let row = sqlx::query_as::<_, ConsumerCursor>(
            "SELECT * FROM courier_consumer_cursors WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Base cursors for a set of consumers, keyed by consumer id. Used by
    /// the retention worker's watermark computation.
    pub async fn base_cursors(&self, consumer_ids: &[String]) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT consumer_id, base_cursor
            FROM courier_consumer_cursors
            WHERE consumer_id = ANY($1)
            "#,
        )
        .bind(consumer_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
