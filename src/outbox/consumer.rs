//! # Consumer Contract
//!
//! The two trait seams between the core and domain handlers:
//!
//! - [`OutboxConsumer`]: what the dispatcher sees — an identifier plus a
//!   non-blocking `wake()` that is safe to call arbitrarily often.
//! - [`OutboxProcessor`]: the idempotent processing body — fetches a batch
//!   via the event log, applies domain logic, reports what it processed.
//!
//! [`CursorConsumer`] ties them together: it debounces wake bursts (quiet
//! period or hard ceiling, whichever first), then runs the cursor lock's
//! drain until a pass reports no work, so a storm of notifications collapses
//! into one drain cycle and constant traffic still cannot starve the drain.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::outbox::cursor::CursorStore;
use crate::outbox::events::EventLog;
use crate::outbox::lock::CursorLock;
use crate::ticker::{DebounceHandle, Debouncer};

/// Result of one processing-callback invocation (spec shape:
/// processed / no-events / error-with-partial-progress).
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Ids just processed; may be non-contiguous with the cursor
    Processed(Vec<i64>),
    /// Nothing left to do
    NoEvents,
    /// Processing failed, optionally after partial progress
    Failed { error: String, processed: Vec<i64> },
}

/// The idempotent processing body a domain consumer supplies.
///
/// `process` receives the base cursor and the ids already processed out of
/// order; it is expected to fetch via [`EventLog::fetch_after`] with exactly
/// those arguments. Handlers must tolerate re-delivery: a lost lease means
/// another worker may re-run a batch that was processed but never recorded.
#[async_trait]
pub trait OutboxProcessor: Send + Sync {
    async fn process(&self, cursor: i64, processed_ids: &[i64]) -> ProcessOutcome;
}

/// What the dispatcher holds: an identifier and a coalescing wake
pub trait OutboxConsumer: Send + Sync {
    fn consumer_id(&self) -> &str;
    /// Non-blocking; bursts are debounced internally
    fn wake(&self);
}

/// A registered consumer: cursor lock + debounced drain task around a
/// caller-supplied [`OutboxProcessor`].
pub struct CursorConsumer {
    consumer_id: String,
    wake_handle: DebounceHandle,
    debouncer: Option<Debouncer>,
}

impl CursorConsumer {
    /// Build and start the drain task. The consumer's cursor row is
    /// initialized at the latest known event id, so a brand-new consumer
    /// starts from "now" instead of replaying all history.
    ///
    /// Must complete before the dispatcher starts.
    pub async fn start<P>(
        consumer_id: impl Into<String>,
        event_log: EventLog,
        lock: CursorLock,
        processor: Arc<P>,
        dispatcher_config: &DispatcherConfig,
    ) -> Result<Self>
    where
        P: OutboxProcessor + 'static,
    {
        let consumer_id = consumer_id.into();

        let store = CursorStore::new(event_log.pool().clone());
        let start_cursor = event_log.latest_event_id().await?;
        store.ensure(&consumer_id, start_cursor).await?;

        info!(
            consumer_id = %consumer_id,
            start_cursor = start_cursor,
            "📋 Outbox consumer registered"
        );

        let drain_id = consumer_id.clone();
        let debouncer = Debouncer::spawn(
            "consumer_wake",
            std::time::Duration::from_millis(dispatcher_config.wake_quiet_ms),
            std::time::Duration::from_millis(dispatcher_config.wake_max_wait_ms),
            move || {
                let lock = lock.clone();
                let processor = Arc::clone(&processor);
                let consumer_id = drain_id.clone();
                async move {
                    // Drain until a pass does no work; the re-run covers
                    // events appended while the previous pass was running
                    loop {
                        match lock.run(processor.as_ref()).await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(e) => {
                                error!(
                                    consumer_id = %consumer_id,
                                    error = %e,
                                    "Drain cycle failed; will retry on next wake"
                                );
                                break;
                            }
                        }
                    }
                }
            },
        );

        Ok(Self {
            consumer_id,
            wake_handle: debouncer.handle(),
            debouncer: Some(debouncer),
        })
    }

    /// Stop the drain task. An in-flight drain finishes its current pass.
    pub async fn stop(mut self) {
        if let Some(debouncer) = self.debouncer.take() {
            debouncer.stop().await;
        }
        debug!(consumer_id = %self.consumer_id, "Outbox consumer stopped");
    }
}

impl OutboxConsumer for CursorConsumer {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn wake(&self) {
        self.wake_handle.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_outcome_shapes() {
        let processed = ProcessOutcome::Processed(vec![6, 7]);
        assert_ne!(processed, ProcessOutcome::NoEvents);

        let failed = ProcessOutcome::Failed {
            error: "search index unavailable".to_string(),
            processed: vec![6],
        };
        match failed {
            ProcessOutcome::Failed { processed, .. } => assert_eq!(processed, vec![6]),
            _ => panic!("wrong variant"),
        }
    }
}
