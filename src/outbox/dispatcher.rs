//! # Event Dispatcher
//!
//! Turns "something changed" into "ask every registered consumer to try
//! draining". One long-lived LISTEN subscription per worker process —
//! registering consumers never open their own — plus two safety nets:
//!
//! - a fallback ticker wakes all consumers periodically even with no
//!   notification, covering dropped pub-sub delivery;
//! - a keepalive probe self-notifies through the pool when an interval
//!   passes silently; two silent intervals in a row mark the subscription
//!   dead and trigger a reconnect with capped exponential backoff.
//!
//! The dispatcher knows nothing about event types. Consumers debounce
//! internally, so waking them on every notification (keepalives included)
//! is harmless.

use parking_lot::RwLock;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::error::{CourierError, Result};
use crate::outbox::consumer::OutboxConsumer;
use crate::outbox::events::WakeSignal;
use crate::ticker::Ticker;

/// Observability snapshot for the subscription connection
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub connected: bool,
    pub notifications_received: u64,
    pub keepalive_probes: u64,
    pub reconnects: u64,
    pub parse_errors: u64,
    pub last_notification_at: Option<SystemTime>,
}

/// LISTEN/NOTIFY fan-out with polling fallback
pub struct Dispatcher {
    pool: PgPool,
    config: DispatcherConfig,
    consumers: Vec<Arc<dyn OutboxConsumer>>,
    stats: Arc<RwLock<DispatcherStats>>,
    shutdown: Option<watch::Sender<bool>>,
    listen_task: Option<JoinHandle<()>>,
    fallback: Option<Ticker>,
}

impl Dispatcher {
    pub fn new(pool: PgPool, config: DispatcherConfig) -> Self {
        Self {
            pool,
            config,
            consumers: Vec::new(),
            stats: Arc::new(RwLock::new(DispatcherStats::default())),
            shutdown: None,
            listen_task: None,
            fallback: None,
        }
    }

    /// Register a consumer. Must happen before `start()`.
    pub fn register(&mut self, consumer: Arc<dyn OutboxConsumer>) -> Result<()> {
        if self.shutdown.is_some() {
            return Err(CourierError::configuration(
                "dispatcher",
                "consumers must be registered before start()",
            ));
        }
        info!(consumer_id = %consumer.consumer_id(), "📚 Consumer registered with dispatcher");
        self.consumers.push(consumer);
        Ok(())
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.read().clone()
    }

    /// Start the subscription loop and the fallback ticker
    pub async fn start(&mut self) -> Result<()> {
        if self.shutdown.is_some() {
            return Err(CourierError::configuration(
                "dispatcher",
                "already started",
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumers: Arc<[Arc<dyn OutboxConsumer>]> = self.consumers.clone().into();

        info!(
            channel = %self.config.channel,
            consumers = consumers.len(),
            "🚀 Starting outbox dispatcher"
        );

        let fallback_consumers = Arc::clone(&consumers);
        self.fallback = Some(Ticker::spawn(
            "dispatcher_fallback",
            Duration::from_secs(self.config.fallback_poll_seconds),
            move || {
                let consumers = Arc::clone(&fallback_consumers);
                async move {
                    debug!("Fallback poll waking all consumers");
                    wake_all(&consumers);
                }
            },
        ));

        let task = ListenLoop {
            pool: self.pool.clone(),
            config: self.config.clone(),
            consumers,
            stats: Arc::clone(&self.stats),
            shutdown_rx,
        };
        self.listen_task = Some(tokio::spawn(task.run()));
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.listen_task.take() {
            let _ = task.await;
        }
        if let Some(fallback) = self.fallback.take() {
            fallback.stop().await;
        }
        self.stats.write().connected = false;
        info!("Outbox dispatcher stopped");
    }
}

fn wake_all(consumers: &[Arc<dyn OutboxConsumer>]) {
    for consumer in consumers {
        consumer.wake();
    }
}

struct ListenLoop {
    pool: PgPool,
    config: DispatcherConfig,
    consumers: Arc<[Arc<dyn OutboxConsumer>]>,
    stats: Arc<RwLock<DispatcherStats>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ListenLoop {
    async fn run(mut self) {
        let mut backoff_ms = self.config.reconnect_base_ms;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.connect().await {
                Ok(listener) => {
                    info!(channel = %self.config.channel, "📡 Dispatcher subscription connected");
                    self.stats.write().connected = true;
                    backoff_ms = self.config.reconnect_base_ms;

                    self.pump(listener).await;

                    {
                        let mut stats = self.stats.write();
                        stats.connected = false;
                        stats.reconnects += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Dispatcher subscription connect failed");
                }
            }

            if *self.shutdown_rx.borrow() {
                break;
            }
            warn!(
                backoff_ms = backoff_ms,
                "Dispatcher reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = self.shutdown_rx.changed() => break,
            }
            backoff_ms = (backoff_ms * 2).min(self.config.reconnect_max_ms);
        }

        debug!("Dispatcher listen loop exited");
    }

    async fn connect(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.config.channel).await?;
        Ok(listener)
    }

    /// Receive until the connection errors out or goes silent past the
    /// keepalive tolerance. Returning triggers a reconnect.
    async fn pump(&mut self, mut listener: PgListener) {
        let keepalive = Duration::from_secs(self.config.keepalive_seconds);
        let mut silent_intervals = 0u32;
        let mut probe_counter: i64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return,
                received = timeout(keepalive, listener.recv()) => match received {
                    Ok(Ok(notification)) => {
                        silent_intervals = 0;
                        {
                            let mut stats = self.stats.write();
                            stats.notifications_received += 1;
                            stats.last_notification_at = Some(SystemTime::now());
                        }

                        match serde_json::from_str::<WakeSignal>(notification.payload()) {
                            Ok(WakeSignal::EventAppended { event_id, event_type }) => {
                                debug!(event_id, event_type = %event_type, "📨 Event notification");
                            }
                            Ok(WakeSignal::Keepalive { probe }) => {
                                debug!(probe, "Keepalive probe echoed back");
                            }
                            Err(e) => {
                                self.stats.write().parse_errors += 1;
                                warn!(
                                    payload = notification.payload(),
                                    error = %e,
                                    "Unparseable notification; waking consumers anyway"
                                );
                            }
                        }

                        // A wake is a wake regardless of payload; consumers
                        // debounce bursts into one drain
                        wake_all(&self.consumers);
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Dispatcher subscription lost");
                        return;
                    }
                    Err(_elapsed) => {
                        silent_intervals += 1;
                        if silent_intervals >= 2 {
                            warn!("Keepalive probe never came back; subscription presumed dead");
                            return;
                        }
                        probe_counter += 1;
                        self.stats.write().keepalive_probes += 1;
                        if let Err(e) = self.send_probe(probe_counter).await {
                            error!(error = %e, "Keepalive probe send failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn send_probe(&self, probe: i64) -> Result<()> {
        let payload = serde_json::to_string(&WakeSignal::Keepalive { probe })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.config.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConsumer {
        id: String,
        wakes: AtomicUsize,
    }

    impl OutboxConsumer for CountingConsumer {
        fn consumer_id(&self) -> &str {
            &self.id
        }
        fn wake(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wake_all_reaches_every_consumer() {
        let consumers: Vec<Arc<dyn OutboxConsumer>> = vec![
            Arc::new(CountingConsumer {
                id: "broadcast".to_string(),
                wakes: AtomicUsize::new(0),
            }),
            Arc::new(CountingConsumer {
                id: "search-index".to_string(),
                wakes: AtomicUsize::new(0),
            }),
        ];
        wake_all(&consumers);
        wake_all(&consumers);
        // Both consumers woken twice; wake() must never block or fail
    }

    #[tokio::test]
    async fn test_register_after_start_is_rejected() {
        let pool = PgPool::connect_lazy("postgresql://localhost/courier_test").unwrap();
        let mut dispatcher = Dispatcher::new(pool.clone(), DispatcherConfig::default());

        let consumer = Arc::new(CountingConsumer {
            id: "broadcast".to_string(),
            wakes: AtomicUsize::new(0),
        });
        dispatcher.register(consumer.clone()).unwrap();

        dispatcher.start().await.unwrap();
        assert!(dispatcher.register(consumer).is_err());
        dispatcher.stop().await;
    }

    #[test]
    fn test_stats_default_disconnected() {
        let stats = DispatcherStats::default();
        assert!(!stats.connected);
        assert_eq!(stats.notifications_received, 0);
        assert_eq!(stats.reconnects, 0);
    }
}
