use chrono::{DateTime, Utc};
use lendq_core::{JobId, QueueName};
use serde::{Deserialize, Serialize};

/// A job state change, as observed by the component that caused it.
///
/// Events are facts: they are emitted after the corresponding store write
/// succeeded, and they carry enough context for metrics and logging without
/// a store lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub queue: QueueName,
    pub job_name: String,
    pub kind: JobEventKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Inserted (not emitted for a deduplicated enqueue).
    Waiting,
    /// Claimed by a worker; `attempt` is 1-based.
    Active { attempt: u32 },
    Progress { percent: u8 },
    Completed { duration_ms: u64 },
    /// A processing attempt failed. `will_retry` is false when the job was
    /// moved to the terminal failed state.
    Failed {
        attempt: u32,
        error: String,
        duration_ms: u64,
        will_retry: bool,
    },
    DeadLettered { reason: String },
}

impl JobEvent {
    pub fn new(job_id: JobId, queue: QueueName, job_name: impl Into<String>, kind: JobEventKind) -> Self {
        Self {
            job_id,
            queue,
            job_name: job_name.into(),
            kind,
            occurred_at: Utc::now(),
        }
    }

    /// Stable event name (`"waiting"`, `"active"`, ...).
    pub fn event_type(&self) -> &'static str {
        self.kind.name()
    }
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active { .. } => "active",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed { will_retry: false, .. })
    }
}
