//! Cancelable scheduled tasks.
//!
//! Debounce, auto-expiry and throttle timers all need the same shape: run
//! a closure after a delay unless canceled first. Wrapping the spawned task
//! in a handle that aborts on drop makes teardown a single deterministic
//! cancel instead of a scatter of timer ids.

use std::future::Future;
use std::time::Duration;

/// Handle to a scheduled task. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct TaskHandle {
    inner: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    /// Runs `fut` after `delay` unless the handle is canceled or dropped.
    pub fn spawn_after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self { inner }
    }

    /// Cancels the task if it has not fired yet.
    pub fn cancel(&self) {
        self.inner.abort();
    }

    /// Whether the task has completed or been canceled.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _handle = TaskHandle::spawn_after(Duration::from_secs(2), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = TaskHandle::spawn_after(Duration::from_secs(1), async move {
            flag.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        {
            let _handle = TaskHandle::spawn_after(Duration::from_secs(1), async move {
                flag.store(true, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
