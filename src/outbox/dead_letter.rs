//! # Dead-Letter Store
//!
//! Terminal quarantine for events that exhausted their retry ceiling for one
//! consumer. Other consumers are unaffected: a dead letter is scoped to a
//! (consumer, event) pair, and the quarantined consumer's cursor advances
//! past the event so it cannot loop on the same poison forever.
//!
//! The business layer observes this table through polling or alerting; there
//! is no synchronous error channel back to producers.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;

/// One row of `courier_dead_letters`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRecord {
    pub id: i64,
    pub consumer_id: String,
    pub event_id: i64,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    pool: PgPool,
}

impl DeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert inside the caller's transaction, so the quarantine and the
    /// cursor advancement past the event commit atomically.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        consumer_id: &str,
        event_id: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO courier_dead_letters (consumer_id, event_id, error)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(consumer_id)
        .bind(event_id)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_for_consumer(
        &self,
        consumer_id: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT * FROM courier_dead_letters
            WHERE consumer_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(consumer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM courier_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
