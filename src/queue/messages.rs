//! # Queue Messages
//!
//! The tenant-sharded message table and its lifecycle updates:
//! `pending → claimed → {completed | retrying → pending | dead_lettered}`.
//!
//! Every mutation is a single conditional row update keyed by the claim
//! owner, so a handler that keeps running after losing its claim cannot
//! clobber state another worker now owns. Claiming is batched — one CTE per
//! (queue, workspace) token, not one query per message.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;

/// One row of `courier_queue_messages`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueMessage {
    pub id: i64,
    pub queue_name: String,
    pub workspace_id: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub process_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_by: Option<Uuid>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub failure_count: i32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// Lifecycle state derived from the row's terminal/claim columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Claimed,
    Completed,
    DeadLettered,
}

impl QueueMessage {
    pub fn state(&self, now: DateTime<Utc>) -> MessageState {
        if self.completed_at.is_some() {
            MessageState::Completed
        } else if self.dead_lettered_at.is_some() {
            MessageState::DeadLettered
        } else if self
            .claim_expires_at
            .map(|expiry| self.claimed_by.is_some() && expiry > now)
            .unwrap_or(false)
        {
            MessageState::Claimed
        } else {
            MessageState::Pending
        }
    }
}

/// Conditional-update queries over the message table
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: PgPool,
}

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `batch_size` ready messages for one (queue, workspace)
    /// in a single statement. A message is ready when it is live, its
    /// `process_after` has passed, and it is unclaimed or its claim expired.
    pub async fn claim_batch(
        &self,
        queue_name: &str,
        workspace_id: &str,
        owner: Uuid,
        batch_size: i64,
        lease_seconds: i64,
    ) -> Result<Vec<QueueMessage>> {
        let rows = sqlx::query_as::<_, QueueMessage>(
            r#"
            WITH ready AS (
                SELECT id FROM courier_queue_messages
                WHERE queue_name = $1
                  AND workspace_id = $2
                  AND completed_at IS NULL
                  AND dead_lettered_at IS NULL
                  AND process_after <= now()
                  AND (claimed_by IS NULL OR claim_expires_at < now())
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE courier_queue_messages m
            SET claimed_by = $4,
                claim_expires_at = now() + ($5::bigint * interval '1 second')
            FROM ready
            WHERE m.id = ready.id
            RETURNING m.*
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id)
        .bind(batch_size)
        .bind(owner)
        .bind(lease_seconds)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Push the claim expiry forward for every message this owner holds.
    /// One statement covers the whole batch.
    pub async fn renew_claims(&self, owner: Uuid, lease_seconds: i64) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE courier_queue_messages
            SET claim_expires_at = now() + ($2::bigint * interval '1 second')
            WHERE claimed_by = $1
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .bind(owner)
        .bind(lease_seconds)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Mark completed. Immediate, never batched, so observability stays
    /// accurate. Returns false if the claim was lost first.
    pub async fn complete(&self, id: i64, owner: Uuid) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_queue_messages
            SET completed_at = now(),
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Record a failure and re-arm the message for a later attempt
    pub async fn fail_retry(
        &self,
        id: i64,
        owner: Uuid,
        error: &str,
        process_after: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_queue_messages
            SET failure_count = failure_count + 1,
                last_error = $3,
                process_after = $4,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .bind(process_after)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Terminal dead-letter transition, inside the caller's transaction so
    /// the optional hook's savepoint can nest under it
    pub async fn mark_dead_lettered_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        owner: Uuid,
        error: &str,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_queue_messages
            SET dead_lettered_at = now(),
                failure_count = failure_count + 1,
                last_error = $3,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message() -> QueueMessage {
        QueueMessage {
            id: 1,
            queue_name: "notifications".to_string(),
            workspace_id: "acme".to_string(),
            payload: serde_json::json!({"user_id": 7}),
            dedupe_key: None,
            process_after: Utc::now() - Duration::seconds(1),
            created_at: Utc::now() - Duration::seconds(1),
            claimed_by: None,
            claim_expires_at: None,
            failure_count: 0,
            last_error: None,
            completed_at: None,
            dead_lettered_at: None,
        }
    }

    #[test]
    fn test_state_pending_when_unclaimed() {
        assert_eq!(message().state(Utc::now()), MessageState::Pending);
    }

    #[test]
    fn test_state_claimed_until_lease_expires() {
        let now = Utc::now();
        let mut msg = message();
        msg.claimed_by = Some(Uuid::new_v4());
        msg.claim_expires_at = Some(now + Duration::seconds(30));
        assert_eq!(msg.state(now), MessageState::Claimed);

        // An expired claim is claimable by anyone: back to pending
        assert_eq!(msg.state(now + Duration::seconds(31)), MessageState::Pending);
    }

    #[test]
    fn test_terminal_states_win() {
        let now = Utc::now();
        let mut msg = message();
        msg.completed_at = Some(now);
        assert_eq!(msg.state(now), MessageState::Completed);

        let mut msg = message();
        msg.dead_lettered_at = Some(now);
        msg.claimed_by = Some(Uuid::new_v4());
        msg.claim_expires_at = Some(now + Duration::seconds(30));
        assert_eq!(msg.state(now), MessageState::DeadLettered);
    }
}
