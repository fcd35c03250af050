use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `min(base * 2^(retries-1), cap)`; a retry count of 0 is treated as the first retry.
pub fn backoff_delay(base: Duration, cap: Duration, retries: u32) -> Duration {
    let exponent = retries.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

struct ArmedTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// One-shot relaunch timers, at most one per process name.
///
/// Lives inside the supervisor's locked state, so arming and cancelling are
/// serialized with every other mutation of the process map.
pub struct RestartScheduler {
    base_delay: Duration,
    cap_delay: Duration,
    next_id: u64,
    timers: HashMap<String, ArmedTimer>,
}

impl RestartScheduler {
    pub fn new(base_delay: Duration, cap_delay: Duration) -> Self {
        Self {
            base_delay,
            cap_delay,
            next_id: 0,
            timers: HashMap::new(),
        }
    }

    pub fn delay_for(&self, retries: u32) -> Duration {
        backoff_delay(self.base_delay, self.cap_delay, retries)
    }

    /// Arms the relaunch timer for `name`, replacing any pending one.
    ///
    /// `relaunch` receives the timer id so the callback can tell whether it is
    /// still the current timer for the name. It is never invoked once `cancel`
    /// has fired.
    pub fn schedule<F>(
        &mut self,
        name: &str,
        retries: u32,
        cancel: CancellationToken,
        relaunch: F,
    ) -> Duration
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.cancel(name).is_some() {
            log::debug!("Replaced pending restart timer for {}", name);
        }

        let delay = self.delay_for(retries);
        self.next_id += 1;
        let id = self.next_id;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !cancel.is_cancelled() {
                        relaunch(id);
                    }
                }
            }
        });

        self.timers.insert(name.to_string(), ArmedTimer { id, handle });
        delay
    }

    /// Forgets the timer for `name` if `id` is the one currently armed.
    ///
    /// Returns false when the timer was superseded or cancelled in the meantime.
    pub fn take_fired(&mut self, name: &str, id: u64) -> bool {
        match self.timers.get(name) {
            Some(timer) if timer.id == id => {
                self.timers.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Aborts the pending timer for `name`, returning its task for joining.
    pub fn cancel(&mut self, name: &str) -> Option<JoinHandle<()>> {
        self.timers.remove(name).map(|timer| {
            timer.handle.abort();
            timer.handle
        })
    }

    pub fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        self.timers
            .drain()
            .map(|(_, timer)| {
                timer.handle.abort();
                timer.handle
            })
            .collect()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.timers
            .get(name)
            .map(|timer| !timer.handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(60);

        assert_eq!(backoff_delay(base, cap, 0), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(40));
        assert_eq!(backoff_delay(base, cap, 4), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, cap, 500), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_saturates() {
        let base = Duration::from_secs(u64::MAX / 2);
        assert_eq!(backoff_delay(base, Duration::MAX, 40), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let mut scheduler = RestartScheduler::new(Duration::from_millis(100), Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let delay = scheduler.schedule("xray", 2, CancellationToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(delay, Duration::from_millis(200));
        assert!(scheduler.is_pending("xray"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("xray"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_cancels_previous_timer() {
        let mut scheduler = RestartScheduler::new(Duration::from_millis(100), Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = fired.clone();
            scheduler.schedule("tunnel", 1, CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_suppresses_relaunch() {
        let mut scheduler = RestartScheduler::new(Duration::from_millis(100), Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cancel = CancellationToken::new();

        scheduler.schedule("nezha", 1, cancel.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cancel.cancel();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_fired_ignores_stale_ids() {
        let mut scheduler = RestartScheduler::new(Duration::from_millis(100), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        scheduler.schedule("xray", 1, cancel.clone(), |_| {});
        scheduler.schedule("xray", 1, cancel.clone(), |_| {});

        assert!(!scheduler.take_fired("xray", 1));
        assert!(scheduler.take_fired("xray", 2));
        assert!(!scheduler.take_fired("xray", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_returns_every_task() {
        let mut scheduler = RestartScheduler::new(Duration::from_millis(100), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        scheduler.schedule("xray", 1, cancel.clone(), |_| {});
        scheduler.schedule("tunnel", 1, cancel.clone(), |_| {});

        let handles = scheduler.cancel_all();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        assert!(!scheduler.is_pending("xray"));
    }
}
