//! Drives one submitted workflow from submission to a terminal state.
//!
//! A [`JobCorrelator`] owns the job's subscription on the event
//! multiplexer, its [`JobTracker`] and its registry entry. Dropping the
//! correlator releases all three; the backend job itself keeps running.

use std::sync::Arc;

use relay_core::job::{InterruptReason, JobEvent, JobState, JobTracker, Transition};
use serde_json::Value;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::api::ComfyBackend;
use crate::error::JobError;
use crate::multiplexer::{EventMultiplexer, Subscription};
use crate::registry::{JobRegistry, Registration};

pub struct JobCorrelator {
    tracker: JobTracker,
    subscription: Subscription,
    registration: Registration,
    submitted_at: Instant,
    timeout: Option<Duration>,
}

impl JobCorrelator {
    /// Subscribe, then submit `workflow` to the backend.
    ///
    /// The prompt id is generated here and sent with the submission so
    /// that the subscription exists before the backend can emit anything
    /// for it. Nothing is submitted while the event connection is down.
    pub async fn submit(
        backend: &dyn ComfyBackend,
        multiplexer: &EventMultiplexer,
        registry: &Arc<JobRegistry>,
        workflow: &Value,
    ) -> Result<Self, JobError> {
        if !multiplexer.is_connected() {
            tracing::warn!(
                client_id = %multiplexer.client_id(),
                "Event connection is down, refusing to submit workflow",
            );
            return Err(JobError::ConnectionLost);
        }

        let prompt_id = Uuid::new_v4().to_string();
        let client_id = multiplexer.client_id();

        let mut subscription = multiplexer.subscribe(&prompt_id);
        let mut registration = registry.register(&prompt_id, client_id);

        let response = backend
            .submit(workflow, client_id, &prompt_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "Workflow submission failed");
            })?;

        if response.prompt_id != prompt_id {
            tracing::warn!(
                requested = %prompt_id,
                assigned = %response.prompt_id,
                "Backend assigned a different prompt id, resubscribing",
            );
            subscription = multiplexer.subscribe(&response.prompt_id);
            registration.rename(&response.prompt_id);
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            client_id = %client_id,
            queue_number = response.number,
            "Workflow submitted",
        );

        let mut tracker = JobTracker::new(response.prompt_id);
        tracker.apply(&JobEvent::Queued);
        registration.set_state(tracker.state());

        Ok(Self {
            tracker,
            subscription,
            registration,
            submitted_at: Instant::now(),
            timeout: None,
        })
    }

    pub fn prompt_id(&self) -> &str {
        self.tracker.job_id()
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn state(&self) -> &JobState {
        self.tracker.state()
    }

    /// Next event that changed the job, in backend order.
    ///
    /// The event that makes the job terminal is returned once; after that
    /// this yields `None`. A closed event feed counts as a lost connection.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        while !self.tracker.is_terminal() {
            let event = self
                .subscription
                .next()
                .await
                .unwrap_or(JobEvent::ConnectionLost);

            match self.tracker.apply(&event) {
                Transition::Unchanged => continue,
                Transition::Advanced => {
                    self.registration.set_state(self.tracker.state());
                    return Some(event);
                }
                Transition::Terminal => {
                    self.finish();
                    return Some(event);
                }
            }
        }
        None
    }

    /// Wait until the job is terminal or `timeout` elapses.
    ///
    /// On timeout the job is marked interrupted locally; the backend is
    /// not told to stop.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), JobError> {
        let deadline = self.submitted_at + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.next_event()).await;
            match next {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    self.expire(timeout);
                    break;
                }
            }
        }

        match self.outcome() {
            Some(outcome) => outcome,
            None => Err(JobError::ConnectionLost),
        }
    }

    /// Give up on a job that ran past `timeout`. The backend is not told
    /// to stop. No-op once terminal.
    pub fn expire(&mut self, timeout: Duration) {
        if !self.tracker.is_terminal() {
            self.timeout = Some(timeout);
        }
        self.interrupt(InterruptReason::Deadline);
    }

    /// Stop waiting on the job. No-op once terminal.
    pub fn interrupt(&mut self, reason: InterruptReason) {
        if self.tracker.interrupt(reason) == Transition::Terminal {
            tracing::warn!(prompt_id = %self.prompt_id(), ?reason, "Stopped waiting on job");
            self.finish();
        }
    }

    /// Result of a terminal job, `None` while it is still running.
    pub fn outcome(&self) -> Option<Result<(), JobError>> {
        let outcome = match self.tracker.state() {
            JobState::Completed => Ok(()),
            JobState::Errored(failure) => Err(JobError::Execution(failure.clone())),
            JobState::Interrupted(InterruptReason::Deadline) => {
                let limit = self.timeout.unwrap_or_else(|| self.submitted_at.elapsed());
                Err(JobError::Timeout(limit))
            }
            JobState::Interrupted(_) => Err(JobError::ConnectionLost),
            JobState::Submitted | JobState::Queued | JobState::Executing { .. } => return None,
        };
        Some(outcome)
    }

    fn finish(&mut self) {
        self.subscription.close();
        self.registration.set_state(self.tracker.state());

        let progress = self.tracker.progress();
        tracing::info!(
            prompt_id = %self.prompt_id(),
            state = self.tracker.state().label(),
            nodes_executed = self.tracker.nodes_executed(),
            nodes_cached = self.tracker.nodes_cached(),
            progress = progress.percent(),
            elapsed_ms = self.submitted_at.elapsed().as_millis() as u64,
            "Job finished",
        );
    }
}

impl Drop for JobCorrelator {
    fn drop(&mut self) {
        if self.tracker.interrupt(InterruptReason::ClientDisconnected) == Transition::Terminal {
            tracing::info!(
                prompt_id = %self.prompt_id(),
                "Caller went away before the job finished; backend job left running",
            );
        }
    }
}
