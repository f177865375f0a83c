//! # Multi-Tenant Job Queue
//!
//! Lease-based background job processing sharded by (queue, workspace):
//!
//! - [`client`] — producer surface: transactional, deduplicated enqueue and
//!   recurring-schedule registration
//! - [`messages`] — the message table, batched claiming, and lifecycle
//!   conditional updates
//! - [`tokens`] — per-(queue, workspace) lease rows that gate claiming and
//!   rotate fairly across tenants
//! - [`manager`] — the worker loop: token leasing, handler dispatch under a
//!   concurrency bound, retry backoff, and dead-lettering
//! - [`cron`] — recurring schedules materialized into ticks and converted
//!   into ordinary messages
//!
//! Delivery is at-least-once. A claim is a lease, not a lock: handlers that
//! outlive their lease lose all writes through the owner-conditioned
//! updates and the message is redone elsewhere.

pub mod client;
pub mod cron;
pub mod manager;
pub mod messages;
pub mod tokens;

pub use client::{QueueClient, SendOptions};
pub use cron::{CronSchedule, CronWorker};
pub use manager::{QueueHandler, QueueManager, QueueStats};
pub use messages::{MessageState, MessageStore, QueueMessage};
pub use tokens::{TokenStore, WorkToken};
