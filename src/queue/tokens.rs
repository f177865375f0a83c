//! # Work Tokens
//!
//! Per-(queue, workspace) lease rows that gate which tenants a worker may
//! claim from. Leasing is the fairness mechanism: candidates are ordered by
//! `last_leased_at` ascending with never-served tenants first, so one noisy
//! workspace cannot monopolize workers. A token is only a candidate when the
//! pair actually has a claimable message, and each cycle takes at most one
//! token per workspace.
//!
//! Tokens expire like every other lease here; a worker that dies mid-batch
//! frees its tenants after `lease_expires_at` with no janitor involved.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// One row of `courier_work_tokens`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkToken {
    pub queue_name: String,
    pub workspace_id: String,
    pub leased_by: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_leased_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    pool: PgPool,
}

impl TokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lease up to `max_tokens` tokens across distinct workspaces, least
    /// recently served first. The outer UPDATE re-checks the lease predicate
    /// so two workers racing over the same candidates split them instead of
    /// double-leasing.
    pub async fn lease_batch(
        &self,
        owner: Uuid,
        queue_names: &[String],
        max_tokens: i64,
        lease_seconds: i64,
    ) -> Result<Vec<WorkToken>> {
        if queue_names.is_empty() || max_tokens <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, WorkToken>(
            r#"
            WITH ranked AS (
                SELECT t.queue_name, t.workspace_id, t.last_leased_at,
                       row_number() OVER (
                           PARTITION BY t.workspace_id
                           ORDER BY t.last_leased_at ASC NULLS FIRST
                       ) AS rn
                FROM courier_work_tokens t
                WHERE t.queue_name = ANY($2)
                  AND (t.leased_by IS NULL OR t.lease_expires_at < now())
                  AND EXISTS (
                      SELECT 1 FROM courier_queue_messages m
                      WHERE m.queue_name = t.queue_name
                        AND m.workspace_id = t.workspace_id
                        AND m.completed_at IS NULL
                        AND m.dead_lettered_at IS NULL
                        AND m.process_after <= now()
                        AND (m.claimed_by IS NULL OR m.claim_expires_at < now())
                  )
            ),
            candidates AS (
                SELECT queue_name, workspace_id FROM ranked
                WHERE rn = 1
                ORDER BY last_leased_at ASC NULLS FIRST
                LIMIT $3
            )
            UPDATE courier_work_tokens t
            SET leased_by = $1,
                lease_expires_at = now() + ($4::bigint * interval '1 second'),
                last_leased_at = now()
            FROM candidates c
            WHERE t.queue_name = c.queue_name
              AND t.workspace_id = c.workspace_id
              AND (t.leased_by IS NULL OR t.lease_expires_at < now())
            RETURNING t.queue_name, t.workspace_id, t.leased_by,
                      t.lease_expires_at, t.last_leased_at
            "#,
        )
        .bind(owner)
        .bind(queue_names)
        .bind(max_tokens)
        .bind(lease_seconds)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Push the lease forward on every token this owner holds
    pub async fn renew(&self, owner: Uuid, lease_seconds: i64) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE courier_work_tokens
            SET lease_expires_at = now() + ($2::bigint * interval '1 second')
            WHERE leased_by = $1
            "#,
        )
        .bind(owner)
        .bind(lease_seconds)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Release one token early. Harmless if the lease already expired and
    /// was taken by someone else.
    pub async fn release(&self, queue_name: &str, workspace_id: &str, owner: Uuid) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE courier_work_tokens
            SET leased_by = NULL, lease_expires_at = NULL
            WHERE queue_name = $1 AND workspace_id = $2 AND leased_by = $3
            "#,
        )
        .bind(queue_name)
        .bind(workspace_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}
