//! Job lifecycle state machine.
//!
//! A job moves `Submitted -> Queued -> Executing` and ends in exactly one
//! of `Completed`, `Errored` or `Interrupted`. [`JobTracker`] applies
//! normalized [`JobEvent`]s to that state; once a terminal state is
//! reached every further event is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Failure detail reported by the backend for a node that raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    /// Node that raised, when the backend reports one.
    pub node_id: Option<String>,
    /// Class of the failing node (e.g. `KSampler`).
    pub node_type: Option<String>,
    /// Exception class name, or `interrupted` for cancelled executions.
    pub exception_type: String,
    /// Human-readable exception summary.
    pub exception_message: String,
}

/// Exception type recorded when the backend reports an interrupted run.
pub const EXCEPTION_INTERRUPTED: &str = "interrupted";

/// A backend notification normalized for a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job was accepted into the backend queue.
    Queued,
    /// The backend picked the job up and began executing it.
    Started,
    /// A node started executing.
    Executing { node: String },
    /// Step-level progress inside a long-running node.
    Progress {
        value: u32,
        max: u32,
        node: Option<String>,
    },
    /// A node finished and recorded output.
    NodeExecuted { node: String },
    /// Nodes skipped because their outputs were cached.
    Cached { nodes: Vec<String> },
    /// The backend finished all work for the job.
    Completed,
    /// A node failed; terminal.
    Failed(ExecutionFailure),
    /// Queue depth broadcast. Carries no job-specific meaning.
    Status { queue_remaining: u32 },
    /// Synthetic: the event connection dropped while the job was in flight.
    ConnectionLost,
}

impl JobEvent {
    /// Whether this event ends the job lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed | JobEvent::Failed(_) | JobEvent::ConnectionLost
        )
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Why a job stopped being waited on without a backend verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The caller's deadline elapsed.
    Deadline,
    /// The backend event connection dropped.
    ConnectionLost,
    /// The caller went away before a terminal event.
    ClientDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Queued,
    /// `node` is the most recently reported executing node, if any.
    Executing { node: Option<String> },
    Completed,
    Errored(ExecutionFailure),
    Interrupted(InterruptReason),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Errored(_) | JobState::Interrupted(_)
        )
    }

    /// Short lowercase name used in logs and stream payloads.
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::Executing { .. } => "executing",
            JobState::Completed => "completed",
            JobState::Errored(_) => "errored",
            JobState::Interrupted(_) => "interrupted",
        }
    }
}

/// Cumulative step progress of the node currently sampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub value: u32,
    pub max: u32,
}

impl Progress {
    /// Completion percentage (0-100), `0` when `max` is unknown.
    pub fn percent(&self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        let ratio = f64::from(self.value.min(self.max)) / f64::from(self.max);
        (ratio * 100.0) as u8
    }
}

/// Effect of applying one event to a [`JobTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State or progress changed; the job is still running.
    Advanced,
    /// Nothing changed (unrelated event, or the job is already terminal).
    Unchanged,
    /// The job just reached a terminal state.
    Terminal,
}

/// An in-flight job as seen by the relay.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub client_id: String,
    pub state: &'static str,
    /// Set once the job reached a terminal state.
    pub finished: bool,
    pub queued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Per-job state machine.
#[derive(Debug, Clone)]
pub struct JobTracker {
    job_id: String,
    state: JobState,
    progress: Progress,
    nodes_executed: u32,
    nodes_cached: u32,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Submitted,
            progress: Progress::default(),
            nodes_executed: 0,
            nodes_cached: 0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn nodes_executed(&self) -> u32 {
        self.nodes_executed
    }

    pub fn nodes_cached(&self) -> u32 {
        self.nodes_cached
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one backend event.
    pub fn apply(&mut self, event: &JobEvent) -> Transition {
        if self.state.is_terminal() {
            return Transition::Unchanged;
        }

        match event {
            JobEvent::Queued => {
                if self.state == JobState::Submitted {
                    self.state = JobState::Queued;
                    Transition::Advanced
                } else {
                    Transition::Unchanged
                }
            }
            JobEvent::Started => {
                self.state = JobState::Executing {
                    node: self.current_node(),
                };
                Transition::Advanced
            }
            JobEvent::Executing { node } => {
                self.state = JobState::Executing {
                    node: Some(node.clone()),
                };
                Transition::Advanced
            }
            JobEvent::Progress { value, max, node } => {
                self.progress = Progress {
                    value: *value,
                    max: *max,
                };
                let node = node.clone().or_else(|| self.current_node());
                self.state = JobState::Executing { node };
                Transition::Advanced
            }
            JobEvent::NodeExecuted { .. } => {
                self.nodes_executed += 1;
                self.state = JobState::Executing {
                    node: self.current_node(),
                };
                Transition::Advanced
            }
            JobEvent::Cached { nodes } => {
                self.nodes_cached += nodes.len() as u32;
                self.state = JobState::Executing {
                    node: self.current_node(),
                };
                Transition::Advanced
            }
            JobEvent::Completed => {
                self.state = JobState::Completed;
                Transition::Terminal
            }
            JobEvent::Failed(failure) => {
                self.state = JobState::Errored(failure.clone());
                Transition::Terminal
            }
            JobEvent::ConnectionLost => {
                self.state = JobState::Interrupted(InterruptReason::ConnectionLost);
                Transition::Terminal
            }
            JobEvent::Status { .. } => Transition::Unchanged,
        }
    }

    /// Stop waiting on the job without a backend verdict.
    pub fn interrupt(&mut self, reason: InterruptReason) -> Transition {
        if self.state.is_terminal() {
            return Transition::Unchanged;
        }
        self.state = JobState::Interrupted(reason);
        Transition::Terminal
    }

    fn current_node(&self) -> Option<String> {
        match &self.state {
            JobState::Executing { node } => node.clone(),
            _ => None,
        }
    }
}
