//! Supervised fire-and-forget work (activation emails).
//!
//! Every task is tracked so shutdown can wait for in-flight notifications, and
//! every outcome is logged with the operation and the account it was for. A
//! panicking task is reported, never propagated.

use std::{future::Future, time::Duration};
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Clone, Debug, Default)]
pub struct Background {
    tracker: TaskTracker,
}

impl Background {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` detached from the caller.
    pub fn spawn<F>(&self, operation: &'static str, email: &str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let span = tracing::info_span!("background", operation, email = %email);
        let email = email.to_string();
        let inner = tokio::spawn(task.instrument(span.clone()));

        self.tracker.spawn(
            async move {
                match inner.await {
                    Ok(Ok(())) => debug!("background task finished"),
                    Ok(Err(err)) => {
                        error!(operation, email = %email, error = ?err, "background task failed");
                    }
                    Err(join_err) => report_join_error(operation, &email, &join_err),
                }
            }
            .instrument(span),
        );
    }

    /// Number of tasks still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for everything spawned so far; new tasks are still accepted afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait up to `grace` for in-flight tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "waiting for background tasks");
        }
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                pending = self.tracker.len(),
                "background tasks still running after shutdown grace period"
            );
        }
    }
}

fn report_join_error(operation: &'static str, email: &str, join_err: &JoinError) {
    if join_err.is_panic() {
        error!(operation, email = %email, "background task panicked");
    } else {
        warn!(operation, email = %email, "background task cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn render_template() -> anyhow::Result<()> {
        panic!("template missing")
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let background = Background::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            background.spawn("test", "a@example.com", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        background.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert!(background.is_empty());
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let background = Background::new();
        background.spawn("failing", "a@example.com", async { Err(anyhow!("smtp down")) });
        background.spawn("panicking", "b@example.com", async { render_template() });
        background.drain().await;

        let survived = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&survived);
        background.spawn("after", "c@example.com", async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        background.drain().await;
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_grace() {
        let background = Background::new();
        background.spawn("slow", "a@example.com", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        background.shutdown(Duration::from_secs(1)).await;
        assert_eq!(background.len(), 1);
    }
}
