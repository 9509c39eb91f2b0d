//! Cancellable background tasks on the tokio runtime.

use std::{future::Future, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

/// Owns a spawned task; dropping the handle aborts it.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `fut` once after `delay`.
    pub fn once<F>(name: &'static str, delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Calls `f` every `period`, starting one period from now. A slow run
    /// pushes the following ones back instead of bursting to catch up.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f().await;
            }
        });
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.handle.take() {
            debug!("cancelling {}", self.name);
            h.abort();
        }
    }

    /// Lets the task run to completion without holding it. Used by a task
    /// that has fired and is tearing down its own handle.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::once("t", Duration::from_secs(60), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(task);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::once("t", Duration::from_secs(60), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_repeats_until_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::every("tick", Duration::from_secs(10), move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(task);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
