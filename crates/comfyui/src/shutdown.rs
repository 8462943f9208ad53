//! Best-effort cancellation of in-flight jobs when the process stops.
//!
//! Runs once, before the HTTP server drains: every unfinished prompt in the
//! [`JobRegistry`] is removed from the backend queue and interrupted, then
//! the queue is polled until it is idle or the grace period elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::ComfyBackend;
use crate::registry::JobRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ShutdownCoordinator {
    backend: Arc<dyn ComfyBackend>,
    registry: Arc<JobRegistry>,
    grace: Duration,
    poll_interval: Duration,
    triggered: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(backend: Arc<dyn ComfyBackend>, registry: Arc<JobRegistry>, grace: Duration) -> Self {
        Self {
            backend,
            registry,
            grace,
            poll_interval: POLL_INTERVAL,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Cancel outstanding jobs and wait for the backend queue to drain.
    ///
    /// Only the first call does anything. Backend errors are logged and
    /// do not stop the sequence.
    pub async fn run(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already triggered");
            return;
        }

        let jobs = self.registry.outstanding();
        if jobs.is_empty() {
            tracing::info!("No in-flight jobs at shutdown");
            return;
        }

        let ids: Vec<String> = jobs.into_iter().map(|job| job.job_id).collect();
        tracing::info!(count = ids.len(), "Cancelling in-flight jobs");

        if let Err(e) = self.backend.delete_queued(&ids).await {
            tracing::error!(error = %e, "Failed to remove queued jobs");
        }
        for prompt_id in &ids {
            match self.backend.interrupt(Some(prompt_id)).await {
                Ok(()) => tracing::info!(prompt_id = %prompt_id, "Interrupted job"),
                Err(e) => tracing::error!(prompt_id = %prompt_id, error = %e, "Failed to interrupt job"),
            }
        }

        self.wait_for_idle().await;
    }

    async fn wait_for_idle(&self) {
        let deadline = Instant::now() + self.grace;
        loop {
            match self.backend.queue_status().await {
                Ok(status) if status.is_idle() => {
                    tracing::info!("Backend queue drained");
                    return;
                }
                Ok(status) => tracing::debug!(
                    running = status.running,
                    pending = status.pending,
                    "Waiting for backend queue to drain",
                ),
                Err(e) => tracing::warn!(error = %e, "Queue status check failed"),
            }

            if Instant::now() + self.poll_interval > deadline {
                tracing::warn!(grace_secs = self.grace.as_secs(), "Shutdown grace period elapsed");
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::QueueStatus;
    use crate::test_support::StubBackend;

    fn busy() -> QueueStatus {
        QueueStatus {
            running: 1,
            pending: 0,
        }
    }

    #[tokio::test]
    async fn interrupts_every_registered_job() {
        let backend = Arc::new(StubBackend::default());
        let registry = Arc::new(JobRegistry::new());
        let _a = registry.register("a", "c1");

        let coordinator =
            ShutdownCoordinator::new(backend.clone(), registry.clone(), Duration::from_secs(5));
        coordinator.run().await;

        assert_eq!(backend.calls(), vec!["delete:a", "interrupt:a"]);
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn second_run_is_a_noop() {
        let backend = Arc::new(StubBackend::default());
        let registry = Arc::new(JobRegistry::new());
        let _a = registry.register("a", "c1");

        let coordinator =
            ShutdownCoordinator::new(backend.clone(), registry.clone(), Duration::from_secs(5));
        coordinator.run().await;
        coordinator.run().await;

        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn nothing_to_do_without_jobs() {
        let backend = Arc::new(StubBackend::default());
        let coordinator = ShutdownCoordinator::new(
            backend.clone(),
            Arc::new(JobRegistry::new()),
            Duration::from_secs(5),
        );
        coordinator.run().await;
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_are_left_alone() {
        let backend = Arc::new(StubBackend::default());
        let registry = Arc::new(JobRegistry::new());
        let done = registry.register("done", "c1");
        done.set_state(&relay_core::job::JobState::Completed);
        let running = registry.register("running", "c1");
        running.set_state(&relay_core::job::JobState::Queued);

        let coordinator =
            ShutdownCoordinator::new(backend.clone(), registry.clone(), Duration::from_secs(5));
        coordinator.run().await;

        assert_eq!(backend.calls(), vec!["delete:running", "interrupt:running"]);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_queue_is_idle() {
        let backend = Arc::new(StubBackend::default());
        backend.queue.lock().unwrap().extend([busy(), busy()]);
        let registry = Arc::new(JobRegistry::new());
        let _a = registry.register("a", "c1");

        let coordinator =
            ShutdownCoordinator::new(backend.clone(), registry.clone(), Duration::from_secs(5));
        let started = Instant::now();
        coordinator.run().await;

        assert_eq!(started.elapsed(), POLL_INTERVAL * 2);
        assert!(backend.queue.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_grace() {
        let backend = Arc::new(StubBackend::default());
        backend.queue.lock().unwrap().extend(std::iter::repeat(busy()).take(100));
        let registry = Arc::new(JobRegistry::new());
        let _a = registry.register("a", "c1");

        let coordinator =
            ShutdownCoordinator::new(backend.clone(), registry.clone(), Duration::from_secs(1));
        let started = Instant::now();
        coordinator.run().await;

        assert!(started.elapsed() <= Duration::from_secs(1));
        assert!(!backend.queue.lock().unwrap().is_empty());
    }
}
