//! In-memory registry of jobs currently in flight.
//!
//! Entries exist only while a request is waiting on its job. The shutdown
//! coordinator reads the registry to know which prompts to cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use relay_core::job::{Job, JobState};

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new in-flight job. The returned guard removes it on drop.
    pub fn register(self: &Arc<Self>, job_id: &str, client_id: &str) -> Registration {
        let job = Job {
            job_id: job_id.to_string(),
            client_id: client_id.to_string(),
            state: JobState::Submitted.label(),
            finished: false,
            queued_at: Utc::now(),
        };
        self.lock().insert(job_id.to_string(), job);
        Registration {
            registry: Arc::clone(self),
            job_id: job_id.to_string(),
        }
    }

    pub fn set_state(&self, job_id: &str, state: &JobState) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.state = state.label();
            job.finished = state.is_terminal();
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    /// Snapshot of the jobs still running on the backend, oldest first.
    /// Finished jobs whose caller has not let go yet are left out.
    pub fn outstanding(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| !job.finished)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.queued_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        // Entries are plain data, so a poisoned lock is still consistent.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a job in the registry for as long as it is alive.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<JobRegistry>,
    job_id: String,
}

impl Registration {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Move the entry to a new id (the backend assigned a different one).
    pub fn rename(&mut self, job_id: &str) {
        let mut jobs = self.registry.lock();
        if let Some(mut job) = jobs.remove(&self.job_id) {
            job.job_id = job_id.to_string();
            jobs.insert(job_id.to_string(), job);
        }
        self.job_id = job_id.to_string();
    }

    pub fn set_state(&self, state: &JobState) {
        self.registry.set_state(&self.job_id, state);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}
