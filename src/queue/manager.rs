//! # Queue Manager
//!
//! The worker-side orchestrator. One manager per process:
//!
//! 1. each polling cycle leases up to a configured number of work tokens
//!    (distinct workspaces, least recently served first);
//! 2. per token, one batched claim pulls messages for that (queue,
//!    workspace) pair and runs them through the registered handler under a
//!    process-wide concurrency bound;
//! 3. a single renewal ticker extends every claim and token this worker
//!    holds, all at once, keyed by the worker's owner id;
//! 4. when a token's work finishes the slot refill is debounced rather than
//!    re-polling immediately, so a burst of completions costs one cycle;
//! 5. a cycle that leases nothing marks itself exhausted and sleeps the
//!    poll interval.
//!
//! Failure handling mirrors the outbox drain: failures below the ceiling
//! reschedule with jittered exponential backoff, the failure that reaches
//! the ceiling dead-letters the message in a transaction, with an optional
//! per-handler hook running in a savepoint so a buggy hook cannot undo the
//! dead-letter transition itself.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{CourierError, Result};
use crate::logging::{log_dead_letter, log_retry_scheduled};
use crate::queue::messages::{MessageStore, QueueMessage};
use crate::queue::tokens::{TokenStore, WorkToken};
use crate::ticker::{Debouncer, Ticker};

/// Message handler for one queue. `handle` errors count toward the failure
/// ceiling; the optional dead-letter hook joins the terminal transition's
/// transaction (via savepoint) for side effects like notifying an operator
/// table.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;

    async fn on_dead_letter(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        _message: &QueueMessage,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Observability counters for the polling loop
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub cycles: u64,
    pub exhausted_cycles: u64,
    pub tokens_leased: u64,
    pub messages_claimed: u64,
    pub messages_completed: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub claims_lost: u64,
}

/// Token-leasing worker loop with handler registry
pub struct QueueManager {
    ctx: Arc<WorkerContext>,
    shutdown: Option<watch::Sender<bool>>,
    poll_task: Option<JoinHandle<()>>,
    refill: Option<Debouncer>,
    renewal: Option<Ticker>,
}

/// Shared state for the poll loop and every spawned token task
struct WorkerContext {
    pool: PgPool,
    config: QueueConfig,
    worker_id: Uuid,
    handlers: DashMap<String, Arc<dyn QueueHandler>>,
    messages: MessageStore,
    tokens: TokenStore,
    stats: RwLock<QueueStats>,
    /// Process-wide bound on concurrently running handlers
    semaphore: Semaphore,
    /// Token tasks currently outstanding; caps how many more a cycle leases
    active_tokens: AtomicI64,
    /// Signalled whenever active_tokens drops, so shutdown can wait for idle
    idle: Notify,
    /// Wakes the poll loop; the refill debouncer fires this
    wake: Notify,
}

impl QueueManager {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        let semaphore = Semaphore::new(config.handler_concurrency);
        let ctx = Arc::new(WorkerContext {
            messages: MessageStore::new(pool.clone()),
            tokens: TokenStore::new(pool.clone()),
            pool,
            config,
            worker_id: Uuid::new_v4(),
            handlers: DashMap::new(),
            stats: RwLock::new(QueueStats::default()),
            semaphore,
            active_tokens: AtomicI64::new(0),
            idle: Notify::new(),
            wake: Notify::new(),
        });
        Self {
            ctx,
            shutdown: None,
            poll_task: None,
            refill: None,
            renewal: None,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.ctx.worker_id
    }

    pub fn stats(&self) -> QueueStats {
        self.ctx.stats.read().clone()
    }

    /// Register the handler for a queue. Must happen before `start()`;
    /// the polling cycle snapshots the registry to decide which queues'
    /// tokens to lease.
    pub fn register_handler(
        &mut self,
        queue_name: impl Into<String>,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<()> {
        if self.shutdown.is_some() {
            return Err(CourierError::configuration(
                "queue_manager",
                "handlers must be registered before start()",
            ));
        }
        let queue_name = queue_name.into();
        if self.ctx.handlers.contains_key(&queue_name) {
            return Err(CourierError::configuration(
                "queue_manager",
                format!("handler already registered for queue {queue_name}"),
            ));
        }
        info!(queue_name = %queue_name, "📚 Queue handler registered");
        self.ctx.handlers.insert(queue_name, handler);
        Ok(())
    }

    /// Start the poll loop, the refill debouncer, and the renewal ticker
    pub fn start(&mut self) -> Result<()> {
        if self.shutdown.is_some() {
            return Err(CourierError::configuration(
                "queue_manager",
                "already started",
            ));
        }
        if self.ctx.handlers.is_empty() {
            return Err(CourierError::configuration(
                "queue_manager",
                "no handlers registered",
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            worker_id = %self.ctx.worker_id,
            queues = self.ctx.handlers.len(),
            max_tokens = self.ctx.config.max_tokens_per_cycle,
            handler_concurrency = self.ctx.config.handler_concurrency,
            "🚀 Starting queue manager"
        );

        let refill_ctx = Arc::clone(&self.ctx);
        self.refill = Some(Debouncer::spawn(
            "queue_refill",
            Duration::from_millis(self.ctx.config.refill_debounce_ms),
            Duration::from_millis(self.ctx.config.refill_debounce_ms * 10),
            move || {
                let ctx = Arc::clone(&refill_ctx);
                async move {
                    ctx.wake.notify_one();
                }
            },
        ));

        let renewal_ctx = Arc::clone(&self.ctx);
        self.renewal = Some(Ticker::spawn(
            "queue_renewal",
            Duration::from_secs(self.ctx.config.renewal_interval_seconds),
            move || {
                let ctx = Arc::clone(&renewal_ctx);
                async move {
                    ctx.renew_leases().await;
                }
            },
        ));

        let poll_ctx = Arc::clone(&self.ctx);
        self.poll_task = Some(tokio::spawn(poll_loop(poll_ctx, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Stop polling, then wait for in-flight token work up to the grace
    /// ceiling. Messages still claimed at the ceiling are abandoned; their
    /// claims lapse and another worker picks them up.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(true);

        if let Some(task) = self.poll_task.take() {
            let _ = task.await;
        }
        if let Some(refill) = self.refill.take() {
            refill.stop().await;
        }

        let grace = Duration::from_secs(self.ctx.config.shutdown_grace_seconds);
        let drained = timeout(grace, self.ctx.wait_idle()).await.is_ok();

        // Renewal stops only after the wait, so surviving work keeps its
        // leases alive until the very end
        if let Some(renewal) = self.renewal.take() {
            renewal.stop().await;
        }

        if drained {
            info!(worker_id = %self.ctx.worker_id, "Queue manager stopped cleanly");
            Ok(())
        } else {
            let pending = self.ctx.active_tokens.load(Ordering::SeqCst).max(0) as usize;
            error!(
                worker_id = %self.ctx.worker_id,
                pending,
                grace_seconds = self.ctx.config.shutdown_grace_seconds,
                "Queue manager shutdown grace expired with work in flight"
            );
            Err(CourierError::ShutdownTimeout {
                timeout_seconds: self.ctx.config.shutdown_grace_seconds,
                pending,
            })
        }
    }
}

async fn poll_loop(ctx: Arc<WorkerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let poll_interval = Duration::from_millis(ctx.config.poll_interval_ms);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match ctx.run_cycle().await {
            Ok(0) => {
                ctx.stats.write().exhausted_cycles += 1;
                debug!("Polling cycle exhausted; sleeping");
            }
            Ok(leased) => {
                debug!(leased, "Polling cycle leased tokens");
            }
            Err(e) => {
                warn!(error = %e, "Polling cycle failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = ctx.wake.notified() => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("Queue poll loop exited");
}

impl WorkerContext {
    /// One polling cycle: lease tokens for however many slots are free and
    /// spawn a task per leased token. Returns tokens leased.
    async fn run_cycle(self: &Arc<Self>) -> Result<usize> {
        self.stats.write().cycles += 1;

        let available =
            self.config.max_tokens_per_cycle - self.active_tokens.load(Ordering::SeqCst);
        if available <= 0 {
            return Ok(0);
        }

        let queues: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        let leased = self
            .tokens
            .lease_batch(
                self.worker_id,
                &queues,
                available,
                self.config.claim_lease_seconds as i64,
            )
            .await?;

        if leased.is_empty() {
            return Ok(0);
        }

        self.stats.write().tokens_leased += leased.len() as u64;
        let count = leased.len();
        for token in leased {
            self.active_tokens.fetch_add(1, Ordering::SeqCst);
            let ctx = Arc::clone(self);
            tokio::spawn(async move {
                ctx.process_token(&token).await;
                ctx.active_tokens.fetch_sub(1, Ordering::SeqCst);
                ctx.idle.notify_waiters();
                ctx.wake.notify_one();
            });
        }
        Ok(count)
    }

    /// Drain one claimed batch for a leased token, then release the token
    #[instrument(skip(self, token), fields(queue = %token.queue_name, workspace = %token.workspace_id))]
    async fn process_token(self: &Arc<Self>, token: &WorkToken) {
        let Some(handler) = self.handlers.get(&token.queue_name).map(|h| h.value().clone()) else {
            // Token table rows outlive handler registrations across deploys
            warn!("No handler for leased token's queue; releasing");
            self.release_token(token).await;
            return;
        };

        let batch = match self
            .messages
            .claim_batch(
                &token.queue_name,
                &token.workspace_id,
                self.worker_id,
                self.config.claim_batch_size,
                self.config.claim_lease_seconds as i64,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Batched claim failed");
                self.release_token(token).await;
                return;
            }
        };

        if batch.is_empty() {
            // Another worker got there first; the EXISTS filter is a hint,
            // not a reservation
            self.release_token(token).await;
            return;
        }

        self.stats.write().messages_claimed += batch.len() as u64;
        debug!(claimed = batch.len(), "📨 Claimed message batch");

        futures::future::join_all(batch.into_iter().map(|message| {
            let ctx = Arc::clone(self);
            let handler = Arc::clone(&handler);
            async move {
                let permit = match ctx.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                ctx.execute(handler.as_ref(), &message).await;
                drop(permit);
            }
        }))
        .await;

        self.release_token(token).await;
    }

    async fn release_token(&self, token: &WorkToken) {
        if let Err(e) = self
            .tokens
            .release(&token.queue_name, &token.workspace_id, self.worker_id)
            .await
        {
            warn!(error = %e, "Token release failed; lease will expire on its own");
        }
    }

    /// Run the handler for one claimed message and settle the outcome
    async fn execute(&self, handler: &dyn QueueHandler, message: &QueueMessage) {
        match handler.handle(message).await {
            Ok(()) => match self.messages.complete(message.id, self.worker_id).await {
                Ok(true) => {
                    self.stats.write().messages_completed += 1;
                    debug!(message_id = message.id, "✅ Message completed");
                }
                Ok(false) => {
                    self.stats.write().claims_lost += 1;
                    warn!(
                        message_id = message.id,
                        "Claim lost before completion; another worker will redo this message"
                    );
                }
                Err(e) => {
                    warn!(message_id = message.id, error = %e, "Completion update failed");
                }
            },
            Err(handler_err) => {
                let error = format!("{handler_err:#}");
                if let Err(e) = self.settle_failure(handler, message, &error).await {
                    warn!(message_id = message.id, error = %e, "Failure settlement failed");
                }
            }
        }
    }

    /// Below the ceiling: reschedule with jittered exponential backoff.
    /// At the ceiling: dead-letter transactionally.
    async fn settle_failure(
        &self,
        handler: &dyn QueueHandler,
        message: &QueueMessage,
        error: &str,
    ) -> Result<()> {
        let attempts = message.failure_count + 1;

        if attempts >= self.config.max_failures {
            return self.dead_letter(handler, message, error).await;
        }

        let delay = retry_backoff(&self.config, attempts);
        let not_before = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        if self
            .messages
            .fail_retry(message.id, self.worker_id, error, not_before)
            .await?
        {
            self.stats.write().messages_retried += 1;
            log_retry_scheduled(&message.queue_name, attempts, not_before, error);
        } else {
            self.stats.write().claims_lost += 1;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        handler: &dyn QueueHandler,
        message: &QueueMessage,
        error: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let moved = self
            .messages
            .mark_dead_lettered_in_tx(&mut tx, message.id, self.worker_id, error)
            .await?;
        if !moved {
            tx.rollback().await?;
            self.stats.write().claims_lost += 1;
            warn!(
                message_id = message.id,
                "Claim lost before dead-letter; leaving the message to its new owner"
            );
            return Ok(());
        }

        // Savepoint: a failing hook rolls back its own writes but never the
        // dead-letter transition
        let mut savepoint = tx.begin().await?;
        match handler.on_dead_letter(&mut savepoint, message).await {
            Ok(()) => savepoint.commit().await?,
            Err(hook_err) => {
                savepoint.rollback().await?;
                warn!(
                    message_id = message.id,
                    error = %format!("{hook_err:#}"),
                    "Dead-letter hook failed; transition kept, hook writes rolled back"
                );
            }
        }

        tx.commit().await?;
        self.stats.write().messages_dead_lettered += 1;
        log_dead_letter(&message.queue_name, message.id, error);
        Ok(())
    }

    /// Renew every message claim and work token this worker holds
    async fn renew_leases(&self) {
        let lease = self.config.claim_lease_seconds as i64;
        match self.messages.renew_claims(self.worker_id, lease).await {
            Ok(0) => {}
            Ok(n) => debug!(renewed = n, "Message claims renewed"),
            Err(e) => warn!(error = %e, "Claim renewal failed"),
        }
        match self.tokens.renew(self.worker_id, lease).await {
            Ok(0) => {}
            Ok(n) => debug!(renewed = n, "Work tokens renewed"),
            Err(e) => warn!(error = %e, "Token renewal failed"),
        }
    }

    async fn wait_idle(&self) {
        while self.active_tokens.load(Ordering::SeqCst) > 0 {
            self.idle.notified().await;
        }
    }
}

/// Exponential backoff with ±10% jitter, capped
fn retry_backoff(config: &QueueConfig, failure_count: i32) -> Duration {
    let exponent = (failure_count - 1).clamp(0, 20) as u32;
    let base = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    let capped = base.min(config.backoff_max_ms);
    let jittered = (capped as f64 * (1.0 + fastrand::f64() * 0.1)) as u64;
    Duration::from_millis(jittered.min(config.backoff_max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl QueueHandler for NoopHandler {
        async fn handle(&self, _message: &QueueMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_pool() -> PgPool {
        PgPool::connect_lazy("postgresql://localhost/courier_test").unwrap()
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = QueueConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            ..QueueConfig::default()
        };

        let first = retry_backoff(&config, 1);
        assert!(first >= Duration::from_millis(1_000));
        assert!(first <= Duration::from_millis(1_100));

        let third = retry_backoff(&config, 3);
        assert!(third >= Duration::from_millis(4_000));
        assert!(third <= Duration::from_millis(4_400));

        let deep = retry_backoff(&config, 12);
        assert_eq!(deep, Duration::from_millis(8_000));
    }

    #[test]
    fn test_backoff_handles_extreme_counts() {
        let config = QueueConfig::default();
        let d = retry_backoff(&config, i32::MAX);
        assert!(d <= Duration::from_millis(config.backoff_max_ms));
        let d = retry_backoff(&config, 0);
        assert!(d >= Duration::from_millis(config.backoff_base_ms));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let mut manager = QueueManager::new(test_pool(), QueueConfig::default());
        manager
            .register_handler("notifications", Arc::new(NoopHandler))
            .unwrap();
        assert!(manager
            .register_handler("notifications", Arc::new(NoopHandler))
            .is_err());
    }

    #[tokio::test]
    async fn test_start_requires_handlers() {
        let mut manager = QueueManager::new(test_pool(), QueueConfig::default());
        assert!(manager.start().is_err());

        manager
            .register_handler("notifications", Arc::new(NoopHandler))
            .unwrap();
        manager.start().unwrap();

        // Registration is frozen once the poll loop snapshots queues
        assert!(manager
            .register_handler("digests", Arc::new(NoopHandler))
            .is_err());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut manager = QueueManager::new(test_pool(), QueueConfig::default());
        assert!(manager.stop().await.is_ok());
    }
}
