//! # Transactional Outbox
//!
//! The append-only event log and everything that drains it:
//!
//! - [`events`] — typed event records, transactional append with commit-time
//!   NOTIFY, and cursor-relative fetching
//! - [`cursor`] — per-consumer cursor state and the sliding-window
//!   compaction that heals commit-order reordering
//! - [`lock`] — the exclusive, time-leased drain slot per consumer
//! - [`consumer`] — the registration contract and debounced wake plumbing
//! - [`dispatcher`] — one LISTEN subscription per process fanning wake-ups
//!   out to every registered consumer, with polling fallback
//! - [`dead_letter`] — quarantine for events that exhausted their retries
//! - [`retention`] — watermark-based garbage collection of consumed events
//!
//! Delivery is at-least-once; consumers must be idempotent. Each consumer
//! owns an independent cursor, so there is no ordering relationship across
//! consumers.

pub mod consumer;
pub mod cursor;
pub mod dead_letter;
pub mod dispatcher;
pub mod events;
pub mod lock;
pub mod retention;

pub use consumer::{CursorConsumer, OutboxConsumer, OutboxProcessor, ProcessOutcome};
pub use cursor::{compact, ConsumerCursor, CursorStore, ProcessedSet};
pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use events::{EventLog, EventPayload, EventRecord, WakeSignal};
pub use lock::CursorLock;
pub use retention::RetentionWorker;
