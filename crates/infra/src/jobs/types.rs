//! Job records, enqueue options and dead-letter records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lendq_core::{DeadLetterId, DedupeKey, DomainError, DomainResult, JobId, QueueName};

use super::retry::BackoffPolicy;

pub const MAX_ATTEMPTS_LIMIT: u32 = 100;
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(24 * 3600);
pub const MAX_ENQUEUE_DELAY: Duration = Duration::from_secs(30 * 24 * 3600);
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -1000..=1000;
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Payload fields checked, in order, for a correlation id.
const CORRELATION_FIELDS: [&str; 5] = ["correlationId", "traceId", "aggregateId", "proposalId", "propostaId"];

/// Persisted job status.
///
/// A failed attempt with retries left goes back to `Waiting` with a future
/// `scheduled_for`; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue defaults merged under [`JobOptions`].
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub priority: i32,
}

impl Default for DefaultJobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            priority: 0,
        }
    }
}

impl DefaultJobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Caller-supplied options for one enqueue. Unset fields fall back to the
/// queue's [`DefaultJobOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    pub dedupe_key: Option<String>,
    pub correlation_id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A validated job, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub queue: QueueName,
    pub name: String,
    pub data: Value,
    pub dedupe_key: Option<DedupeKey>,
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub scheduled_for: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    /// Merge `options` over `defaults` and validate everything.
    pub fn build(
        queue: QueueName,
        name: impl Into<String>,
        data: Value,
        options: JobOptions,
        defaults: &DefaultJobOptions,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() || name.len() > MAX_JOB_NAME_LEN {
            return Err(DomainError::validation(format!(
                "job name must be 1..={MAX_JOB_NAME_LEN} characters"
            )));
        }

        let max_attempts = options.attempts.unwrap_or(defaults.attempts);
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
            return Err(DomainError::validation(format!(
                "attempts must be in 1..={MAX_ATTEMPTS_LIMIT}, got {max_attempts}"
            )));
        }

        let backoff = options.backoff.unwrap_or(defaults.backoff);
        if backoff.delay > MAX_BACKOFF_DELAY {
            return Err(DomainError::validation("backoff delay must be at most 24h"));
        }

        let priority = options.priority.unwrap_or(defaults.priority);
        if !PRIORITY_RANGE.contains(&priority) {
            return Err(DomainError::validation(format!(
                "priority must be in {}..={}, got {priority}",
                PRIORITY_RANGE.start(),
                PRIORITY_RANGE.end()
            )));
        }

        let delay = options.delay.unwrap_or_default();
        if delay > MAX_ENQUEUE_DELAY {
            return Err(DomainError::validation("delay must be at most 30 days"));
        }

        let dedupe_key = options.dedupe_key.map(DedupeKey::new).transpose()?;
        let correlation_id = options
            .correlation_id
            .filter(|c| !c.trim().is_empty())
            .or_else(|| extract_correlation_id(&data));

        let now = Utc::now();
        let scheduled_for = chrono::Duration::from_std(delay)
            .map(|d| now + d)
            .map_err(|_| DomainError::validation("delay out of range"))?;

        Ok(Self {
            id: JobId::new(),
            queue,
            name,
            data,
            dedupe_key,
            priority,
            max_attempts,
            backoff,
            scheduled_for,
            correlation_id,
            created_at: now,
        })
    }
}

/// First non-empty string among the well-known correlation fields.
pub fn extract_correlation_id(data: &Value) -> Option<String> {
    let obj = data.as_object()?;
    CORRELATION_FIELDS
        .iter()
        .filter_map(|field| obj.get(*field).and_then(Value::as_str))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub name: String,
    pub data: Value,
    pub dedupe_key: Option<DedupeKey>,
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub status: JobStatus,
    /// Incremented when the job is claimed.
    pub attempts_made: u32,
    pub progress: u8,
    pub scheduled_for: DateTime<Utc>,
    /// Start of the latest attempt.
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn from_new(new: NewJob) -> Self {
        Self {
            id: new.id,
            queue: new.queue,
            name: new.name,
            data: new.data,
            dedupe_key: new.dedupe_key,
            priority: new.priority,
            max_attempts: new.max_attempts,
            backoff: new.backoff,
            status: JobStatus::Waiting,
            attempts_made: 0,
            progress: 0,
            scheduled_for: new.scheduled_for,
            processed_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_stack: None,
            correlation_id: new.correlation_id,
            created_at: new.created_at,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.scheduled_for <= now && self.attempts_made < self.max_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Claim order: higher priority first, then older first.
    pub fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    }
}

/// Result of an enqueue. `duplicate` is set when an outstanding job with the
/// same dedupe key already existed and was returned instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job: Job,
    pub duplicate: bool,
}

/// Job counts for one queue. `delayed` jobs are waiting but not yet due and
/// are not included in `waiting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting + self.delayed,
            JobStatus::Active => self.active,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Message is the full cause chain; stack is the debug rendering, which
    /// includes a backtrace when one was captured.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            stack: Some(format!("{err:?}")),
        }
    }

    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("processor panicked: {detail}"))
    }
}

/// Where this process runs; stamped on dead-letter records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub environment: String,
    pub server_instance: String,
}

impl Default for InstanceInfo {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server_instance: "unknown".to_string(),
        }
    }
}

impl InstanceInfo {
    pub fn new(environment: impl Into<String>, server_instance: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            server_instance: server_instance.into(),
        }
    }

    /// `APP_ENV` and `HOSTNAME`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            environment: lookup("APP_ENV").filter(|v| !v.is_empty()).unwrap_or(defaults.environment),
            server_instance: lookup("HOSTNAME").filter(|v| !v.is_empty()).unwrap_or(defaults.server_instance),
        }
    }
}

/// Immutable audit record of a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub original_queue: QueueName,
    pub original_job_name: String,
    pub original_data: Value,
    pub failure_reason: String,
    pub failure_stack: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub original_created_at: DateTime<Utc>,
    pub processing_duration_ms: u64,
    pub environment: String,
    pub server_instance: String,
    pub correlation_id: Option<String>,
    pub metadata: Value,
    /// Set by operator tooling outside this crate; always false here.
    pub investigated: bool,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_job(job: &Job, failure: &JobFailure, processing: Duration, instance: &InstanceInfo) -> Self {
        let now = Utc::now();
        let processing_duration_ms = u64::try_from(processing.as_millis()).unwrap_or(u64::MAX);
        Self {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            original_queue: job.queue.clone(),
            original_job_name: job.name.clone(),
            original_data: job.data.clone(),
            failure_reason: failure.message.clone(),
            failure_stack: failure.stack.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            original_created_at: job.created_at,
            processing_duration_ms,
            environment: instance.environment.clone(),
            server_instance: instance.server_instance.clone(),
            correlation_id: job.correlation_id.clone(),
            metadata: serde_json::json!({
                "job_options": {
                    "priority": job.priority,
                    "max_attempts": job.max_attempts,
                    "backoff": job.backoff,
                    "dedupe_key": job.dedupe_key,
                },
                "processing": {
                    "processed_at": job.processed_at,
                    "failed_at": now,
                    "duration_ms": processing_duration_ms,
                },
            }),
            investigated: false,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> QueueName {
        QueueName::new("payments").unwrap()
    }

    fn build(options: JobOptions) -> DomainResult<NewJob> {
        NewJob::build(queue(), "pay-proposal", json!({}), options, &DefaultJobOptions::default())
    }

    #[test]
    fn defaults_fill_unset_options() {
        let job = build(JobOptions::new().with_priority(5)).unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff, BackoffPolicy::exponential(Duration::from_millis(2_000)));
        assert_eq!(job.priority, 5);
        assert!(job.scheduled_for <= Utc::now());
    }

    #[test]
    fn rejects_out_of_range_options() {
        assert!(build(JobOptions::new().with_attempts(0)).unwrap_err().is_validation());
        assert!(build(JobOptions::new().with_attempts(101)).is_err());
        assert!(build(JobOptions::new().with_priority(1001)).is_err());
        assert!(build(JobOptions::new().with_delay(Duration::from_secs(31 * 24 * 3600))).is_err());
        assert!(build(JobOptions::new().with_backoff(BackoffPolicy::fixed(Duration::from_secs(25 * 3600)))).is_err());
        assert!(build(JobOptions::new().with_dedupe_key(" ")).is_err());
        assert!(
            NewJob::build(queue(), "", json!({}), JobOptions::new(), &DefaultJobOptions::default()).is_err()
        );
    }

    #[test]
    fn delay_pushes_schedule_forward() {
        let job = build(JobOptions::new().with_delay(Duration::from_secs(60))).unwrap();
        assert!(job.scheduled_for > job.created_at + chrono::Duration::seconds(59));
    }

    #[test]
    fn correlation_id_from_payload_fields() {
        assert_eq!(
            extract_correlation_id(&json!({"proposalId": "p-1", "traceId": "t-9"})),
            Some("t-9".to_string())
        );
        assert_eq!(extract_correlation_id(&json!({"propostaId": "p-2"})), Some("p-2".into()));
        assert_eq!(extract_correlation_id(&json!({"proposalId": 42})), None);
        assert_eq!(extract_correlation_id(&json!("scalar")), None);

        let explicit = NewJob::build(
            queue(),
            "pay",
            json!({"proposalId": "p-1"}),
            JobOptions::new().with_correlation_id("c-1"),
            &DefaultJobOptions::default(),
        )
        .unwrap();
        assert_eq!(explicit.correlation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn claim_order_is_priority_then_age() {
        let mut a = Job::from_new(build(JobOptions::new()).unwrap());
        let mut b = Job::from_new(build(JobOptions::new()).unwrap());
        let c = Job::from_new(build(JobOptions::new().with_priority(10)).unwrap());
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        b.created_at = Utc::now();

        let mut jobs = vec![b.clone(), a.clone(), c.clone()];
        jobs.sort_by(Job::claim_order);
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![c.id, a.id, b.id]);
    }

    #[test]
    fn failure_from_error_keeps_chain() {
        let err = anyhow::anyhow!("connection reset").context("bank transfer failed");
        let failure = JobFailure::from_error(&err);
        assert_eq!(failure.message, "bank transfer failed: connection reset");
        assert!(failure.stack.is_some());

        let panicked = JobFailure::from_panic(Box::new("index out of bounds"));
        assert_eq!(panicked.message, "processor panicked: index out of bounds");
    }

    #[test]
    fn instance_info_from_lookup() {
        let info = InstanceInfo::from_lookup(|k| match k {
            "APP_ENV" => Some("production".into()),
            _ => None,
        });
        assert_eq!(info, InstanceInfo::new("production", "unknown"));
    }

    #[test]
    fn dead_letter_record_copies_job_context() {
        let mut job = Job::from_new(
            NewJob::build(
                queue(),
                "pay-proposal",
                json!({"proposalId": "p-7"}),
                JobOptions::new().with_attempts(1),
                &DefaultJobOptions::default(),
            )
            .unwrap(),
        );
        job.attempts_made = 1;
        job.status = JobStatus::Failed;

        let record = DeadLetterRecord::from_job(
            &job,
            &JobFailure::new("declined"),
            Duration::from_millis(250),
            &InstanceInfo::new("test", "host-1"),
        );
        assert_eq!(record.original_job_id, job.id);
        assert_eq!(record.failure_reason, "declined");
        assert_eq!(record.processing_duration_ms, 250);
        assert_eq!(record.correlation_id.as_deref(), Some("p-7"));
        assert_eq!(record.metadata["job_options"]["max_attempts"], 1);
        assert!(!record.investigated);
    }
}
