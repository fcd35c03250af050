use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodic liveness ticks, at most one loop per process name.
pub struct HealthChecker {
    interval: Duration,
    loops: HashMap<String, JoinHandle<()>>,
}

impl HealthChecker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            loops: HashMap::new(),
        }
    }

    /// Installs the check loop for `name`, stopping any previous one first.
    ///
    /// `tick` runs once per interval and returns whether the loop should keep
    /// going. Ticks are never queued: the next sleep starts after `tick` returns.
    pub fn arm<F>(&mut self, name: &str, cancel: CancellationToken, tick: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.disarm(name);

        let interval = self.interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if !tick() {
                    break;
                }
            }
        });

        self.loops.insert(name.to_string(), handle);
    }

    pub fn disarm(&mut self, name: &str) -> Option<JoinHandle<()>> {
        self.loops.remove(name).map(|handle| {
            handle.abort();
            handle
        })
    }

    pub fn disarm_all(&mut self) -> Vec<JoinHandle<()>> {
        self.loops
            .drain()
            .map(|(_, handle)| {
                handle.abort();
                handle
            })
            .collect()
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.loops
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval() {
        let mut checker = HealthChecker::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        checker.arm("xray", CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(checker.is_armed("xray"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_stops_loop() {
        let mut checker = HealthChecker::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        checker.arm("tunnel", CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!checker.is_armed("tunnel"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_keeps_single_loop() {
        let mut checker = HealthChecker::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = ticks.clone();
            checker.arm("nezha", CancellationToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_all_loops() {
        let mut checker = HealthChecker::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        checker.arm("xray", cancel.clone(), || true);
        checker.arm("tunnel", cancel.clone(), || true);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!checker.is_armed("xray"));
        assert!(!checker.is_armed("tunnel"));
        assert_eq!(checker.disarm_all().len(), 2);
    }
}
