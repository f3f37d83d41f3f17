//! Periodic and one-shot timers driving background callbacks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs a callback after each interval in its own task.
///
/// The callback is awaited in place, so a slow callback delays the next tick;
/// ticks missed meanwhile are skipped rather than queued.
#[derive(Debug, Default)]
pub struct PeriodicTimer {
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `callback` every `interval`, first after one interval. Restarts
    /// the timer if it was already running.
    pub async fn start_periodic<F, Fut>(&mut self, interval: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(interval, true, callback).await;
    }

    /// Fire `callback` once after `delay`.
    pub async fn start_one_shot<F, Fut>(&mut self, delay: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(delay, false, callback).await;
    }

    async fn start<F, Fut>(&mut self, interval: Duration, periodic: bool, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop().await;

        let interval = interval.max(Duration::from_millis(1));
        self.cancel = CancellationToken::new();
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                callback().await;
                if !periodic {
                    break;
                }
            }
            running.store(false, Ordering::Release);
            debug!("Timer exited");
        }));
    }

    /// Stop and wait for an in-flight callback to finish.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Timer task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::future::Ready<()> + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_repeatedly() {
        let (count, callback) = counter();
        let mut timer = PeriodicTimer::new();
        timer.start_periodic(Duration::from_millis(100), callback).await;
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        timer.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let (count, callback) = counter();
        let mut timer = PeriodicTimer::new();
        timer.start_one_shot(Duration::from_millis(50), callback).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick_never_fires() {
        let (count, callback) = counter();
        let mut timer = PeriodicTimer::new();
        timer.start_periodic(Duration::from_secs(10), callback).await;
        timer.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callback_skips_missed_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::new();
        timer
            .start_periodic(Duration::from_millis(100), move || {
                let c = Arc::clone(&c);
                async move {
                    // Only the first run is slow.
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(350)).await;
                    }
                }
            })
            .await;

        // 100 (busy until 450), one late tick at 450, then 500..=800 on schedule.
        // A burst of the ticks missed at 200, 300 and 400 would make this 8.
        tokio::time::sleep(Duration::from_millis(850)).await;
        timer.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }
}
