//! # Periodic Timer Abstractions
//!
//! Two cancellable timer primitives shared by every background loop in the
//! crate: [`Ticker`] for fixed-period work (lease refresh, claim renewal,
//! dispatcher fallback polling, retention passes) and [`Debouncer`] for
//! coalescing bursts of wake signals (consumer wake, queue slot refill).
//!
//! Both are explicit about lifecycle: `spawn` starts the background task,
//! `stop` cancels it and waits for it to exit. Cancelling a [`Ticker`] before
//! releasing the lease it refreshes is what prevents a renewal racing a
//! release.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A cancellable periodic background task.
///
/// The first tick fires one full period after `spawn`, not immediately;
/// every caller in this crate spawns a ticker to *maintain* freshly
/// established state (a lease just claimed, a poll just completed).
pub struct Ticker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    name: &'static str,
}

impl Ticker {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately on the first tick; swallow it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        trace!(ticker = name, "tick");
                        task().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(ticker = name, "Ticker stopped");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown,
            handle,
            name,
        }
    }

    /// Cancel the ticker and wait for the background task to exit.
    /// After `stop` returns, no further tick will run.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        debug!(ticker = self.name, "Ticker shut down");
    }
}

/// Handle for signalling a [`Debouncer`]. Cloneable, non-blocking, safe to
/// call from any context arbitrarily often.
#[derive(Clone)]
pub struct DebounceHandle {
    notify: Arc<Notify>,
}

impl DebounceHandle {
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}

/// Debounce-with-max-wait signal coalescer.
///
/// After the first signal, fires once either a quiet period elapses with no
/// further signals or a hard ceiling since the first signal is reached,
/// whichever comes first. The ceiling prevents starvation under constant
/// traffic; the quiet period collapses notification storms into one firing.
pub struct Debouncer {
    handle: DebounceHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(
        name: &'static str,
        quiet: Duration,
        max_wait: Duration,
        mut on_fire: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let notify = Arc::new(Notify::new());
        let handle = DebounceHandle {
            notify: Arc::clone(&notify),
        };
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                // Wait for the first signal of a burst
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let ceiling = Instant::now() + max_wait;
                loop {
                    let quiet_deadline = Instant::now() + quiet;
                    let deadline = quiet_deadline.min(ceiling);
                    tokio::select! {
                        _ = sleep_until(deadline) => break,
                        _ = notify.notified() => {
                            // Another signal inside the quiet period; keep
                            // waiting unless the ceiling has been reached
                            if Instant::now() >= ceiling {
                                break;
                            }
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }

                trace!(debouncer = name, "debounce fired");
                on_fire().await;
            }
            debug!(debouncer = name, "Debouncer stopped");
        });

        Self {
            handle,
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> DebounceHandle {
        self.handle.clone()
    }

    pub fn signal(&self) {
        self.handle.signal();
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_periodically_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let ticker = Ticker::spawn("test", Duration::from_millis(100), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!((2..=4).contains(&seen), "expected ~3 ticks, got {seen}");

        ticker.stop().await;
        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_does_not_fire_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let ticker = Ticker::spawn("test", Duration::from_millis(100), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_collapses_burst_into_one_firing() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::spawn(
            "test",
            Duration::from_millis(25),
            Duration::from_millis(500),
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        for _ in 0..10 {
            debouncer.signal();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        debouncer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_ceiling_fires_under_constant_traffic() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::spawn(
            "test",
            Duration::from_millis(25),
            Duration::from_millis(100),
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        // Signal every 10ms: the quiet period never elapses, so only the
        // ceiling can fire
        for _ in 0..30 {
            debouncer.signal();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(
            count.load(Ordering::SeqCst) >= 2,
            "ceiling should have fired at least twice over 300ms"
        );
        debouncer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_idle_without_signal() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::spawn(
            "test",
            Duration::from_millis(25),
            Duration::from_millis(100),
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        debouncer.stop().await;
    }
}
