//! # Event Log
//!
//! Append-only log of typed domain events, the single source of truth every
//! consumer drains from. Producers append inside their own business
//! transaction; the NOTIFY issued in the same transaction is delivered by
//! Postgres only at commit, which gives us the "wake signal after
//! commit-visible insert" guarantee for free.
//!
//! No locking happens here. `fetch_after` callers must hold the consumer's
//! cursor lock, and must treat `(cursor, exclude_ids)` as "the next ids to
//! process", not "the highest id seen" — that distinction is what lets the
//! cursor lock heal commit-order reordering instead of skipping events.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

/// Typed event payload, tagged by event type at the storage boundary.
///
/// Consumers pattern-match on the variant instead of downcasting opaque
/// JSON. The serde tag doubles as the denormalized `event_type` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    MessageCreated {
        message_id: i64,
        channel_id: i64,
        workspace_id: String,
        author_id: i64,
    },
    MessageUpdated {
        message_id: i64,
        channel_id: i64,
        workspace_id: String,
    },
    MessageDeleted {
        message_id: i64,
        channel_id: i64,
        workspace_id: String,
    },
    ReactionAdded {
        message_id: i64,
        workspace_id: String,
        user_id: i64,
        emoji: String,
    },
    MembershipChanged {
        channel_id: i64,
        workspace_id: String,
        user_id: i64,
        added: bool,
    },
    FileAttached {
        message_id: i64,
        workspace_id: String,
        file_id: i64,
    },
    AgentSessionUpdated {
        session_id: i64,
        workspace_id: String,
        status: String,
    },
}

impl EventPayload {
    /// The type tag as stored in the `event_type` column
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "message_created",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::MembershipChanged { .. } => "membership_changed",
            Self::FileAttached { .. } => "file_attached",
            Self::AgentSessionUpdated { .. } => "agent_session_updated",
        }
    }
}

/// An event as read back from the log. Immutable once written; rows are
/// deleted only by the retention worker.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

/// Notification payload sent over the dispatcher channel. Kept minimal:
/// it is a wake signal, not a data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeSignal {
    EventAppended { event_id: i64, event_type: String },
    Keepalive { probe: i64 },
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_record(self) -> Result<EventRecord> {
        Ok(EventRecord {
            id: self.id,
            payload: serde_json::from_value(self.payload)?,
            created_at: self.created_at,
        })
    }
}

/// Handle on the append-only event log
#[derive(Debug, Clone)]
pub struct EventLog {
    pool: PgPool,
    channel: String,
}

impl EventLog {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append an event inside the caller's transaction.
    ///
    /// The id returned here is allocated at insert but only becomes visible
    /// to `fetch_after` once the caller commits — the source of the
    /// reordering problem the cursor lock compensates for.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: EventPayload,
    ) -> Result<EventRecord> {
        let event_type = payload.event_type();
        let body = serde_json::to_value(&payload)?;

        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO courier_events (event_type, payload)
            VALUES ($1, $2)
            RETURNING id, created_at
            "#,
        )
        .bind(event_type)
        .bind(&body)
        .fetch_one(&mut **tx)
        .await?;

        let signal = serde_json::to_string(&WakeSignal::EventAppended {
            event_id: row.0,
            event_type: event_type.to_string(),
        })?;

        // Delivered at commit, dropped on rollback
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&signal)
            .execute(&mut **tx)
            .await?;

        debug!(event_id = row.0, event_type = event_type, "📤 Event appended");

        Ok(EventRecord {
            id: row.0,
            payload,
            created_at: row.1,
        })
    }

    /// Fetch up to `limit` events with `id > cursor`, ascending, excluding
    /// ids the caller already processed out of order.
    pub async fn fetch_after(
        &self,
        cursor: i64,
        limit: i64,
        exclude_ids: &[i64],
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, payload, created_at
            FROM courier_events
            WHERE id > $1 AND NOT (id = ANY($2))
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(cursor)
        .bind(exclude_ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_record).collect()
    }

    /// Oldest event past the cursor not yet processed, if any. Used by the
    /// cursor lock to pick the poison event for dead-lettering.
    pub async fn oldest_unprocessed(
        &self,
        cursor: i64,
        exclude_ids: &[i64],
    ) -> Result<Option<EventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, payload, created_at
            FROM courier_events
            WHERE id > $1 AND NOT (id = ANY($2))
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(cursor)
        .bind(exclude_ids)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRow::into_record).transpose()
    }

    /// Highest event id currently visible, or 0 on an empty log. New
    /// consumers initialize their cursor here instead of replaying history.
    pub async fn latest_event_id(&self) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT max(id) FROM courier_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(id.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trips_through_storage_shape() {
        let payload = EventPayload::MessageCreated {
            message_id: 42,
            channel_id: 7,
            workspace_id: "acme".to_string(),
            author_id: 3,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event_type"], "message_created");
        assert_eq!(json["message_id"], 42);

        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_event_type_accessor_matches_serde_tag() {
        let cases = vec![
            EventPayload::MessageDeleted {
                message_id: 1,
                channel_id: 1,
                workspace_id: "w".to_string(),
            },
            EventPayload::ReactionAdded {
                message_id: 1,
                workspace_id: "w".to_string(),
                user_id: 2,
                emoji: "🎉".to_string(),
            },
            EventPayload::AgentSessionUpdated {
                session_id: 9,
                workspace_id: "w".to_string(),
                status: "superseded".to_string(),
            },
        ];
        for payload in cases {
            let json = serde_json::to_value(&payload).unwrap();
            assert_eq!(json["event_type"], payload.event_type());
        }
    }

    #[test]
    fn test_wake_signal_shape() {
        let signal = WakeSignal::EventAppended {
            event_id: 10,
            event_type: "message_created".to_string(),
        };
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"kind\":\"event_appended\""));

        let parsed: WakeSignal = serde_json::from_str(&json).unwrap();
        match parsed {
            WakeSignal::EventAppended { event_id, .. } => assert_eq!(event_id, 10),
            WakeSignal::Keepalive { .. } => panic!("wrong variant"),
        }
    }
}
