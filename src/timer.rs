//! Shared timer service backed by the tokio runtime.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle to a scheduled callback. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TimerTask {
    handle: JoinHandle<()>,
}

impl TimerTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Schedules one-shot and repeated callbacks on a runtime.
#[derive(Debug, Clone)]
pub struct Timer {
    runtime: Handle,
}

impl Timer {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Timer on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Run `callback` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerTask
    where
        F: FnOnce() + Send + 'static,
    {
        trace!(delay_ms = delay.as_millis() as u64, "Scheduling timer task");
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerTask { handle }
    }

    /// Run `callback` every `period`, first after one period.
    pub fn schedule_repeated<F>(&self, period: Duration, mut callback: F) -> TimerTask
    where
        F: FnMut() + Send + 'static,
    {
        let handle = self.runtime.spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                callback();
            }
        });
        TimerTask { handle }
    }

    /// Spawn a future on the timer's runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let timer = Timer::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _task = timer.schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let timer = Timer::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = timer.schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_task_ticks() {
        let timer = Timer::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = timer.schedule_repeated(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        task.cancel();
    }
}
