//! # Courier Core
//!
//! Postgres-backed delivery core for collaborative messaging backends: a
//! transactional outbox with per-consumer cursors, and a multi-tenant job
//! queue. Postgres is the only coordination mechanism — every lock in the
//! system is a row with an expiry column, claimed and released through
//! conditional updates, so any worker can crash at any point and the system
//! heals when its leases lapse.
//!
//! ## Architecture
//!
//! - **[`outbox`]** — append-only event log written in the producer's
//!   transaction, drained by registered consumers. Each consumer owns a
//!   cursor compacted through a sliding gap window that tolerates ids
//!   becoming visible out of commit order. LISTEN/NOTIFY wakes consumers
//!   with a polling fallback; events that exhaust their retries are
//!   quarantined, and a retention worker garbage-collects behind the
//!   slowest configured cursor.
//! - **[`queue`]** — (queue, workspace)-sharded job processing. Work
//!   tokens rotate fairly across tenants, claims are batched and
//!   lease-renewed, failures back off exponentially until a dead-letter
//!   ceiling, and recurring schedules materialize into ordinary messages.
//! - **[`database`]** — pool construction and embedded migrations.
//! - **[`ticker`]** — the cancellable timer primitives every background
//!   loop is built on.
//! - **[`health`]** — point-in-time operational snapshot.
//!
//! ## Delivery semantics
//!
//! Everything is at-least-once. Consumers and handlers must be idempotent;
//! the crate guarantees no event is skipped and no message is lost, not
//! that either is seen exactly once.

pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod outbox;
pub mod queue;
pub mod ticker;

pub use config::CourierConfig;
pub use database::{DatabaseConnection, DatabaseMigrations};
pub use error::{CourierError, Result};
pub use health::HealthSnapshot;
pub use outbox::{
    CursorConsumer, Dispatcher, EventLog, EventPayload, OutboxProcessor, ProcessOutcome,
    RetentionWorker,
};
pub use queue::{CronWorker, QueueClient, QueueHandler, QueueManager, QueueMessage, SendOptions};
