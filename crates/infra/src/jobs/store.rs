//! Job store abstraction.
//!
//! The store is the only coordination point between workers. Every
//! operation is a single atomic step: implementations must not rely on
//! locks held across calls.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use lendq_core::{JobId, QueueName};

use super::types::{Enqueued, Job, JobCounts, JobFailure, NewJob};

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The job was not in the state the transition expects (already
    /// completed, reclaimed after a stall, ...).
    #[error("stale transition for job {0}")]
    StaleTransition(JobId),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Jobs moved out of `active` by [`JobStore::recover_stalled`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StalledRecovery {
    /// Back to `waiting`; attempts remain.
    pub requeued: Vec<Job>,
    /// Moved to terminal `failed`; need a dead-letter record.
    pub failed: Vec<Job>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. With a dedupe key, an outstanding (not terminally
    /// failed) job with the same `(queue, key)` is returned instead with
    /// `duplicate = true`; concurrent callers all see the same job id.
    async fn insert(&self, job: NewJob) -> Result<Enqueued, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Move up to `limit` due `waiting` jobs to `active`, incrementing
    /// `attempts_made`. Returns only the rows this call won, ordered by
    /// priority (desc) then age.
    async fn claim_batch(&self, queue: &QueueName, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// `active` → `completed`. `attempts_made` must match the claimed
    /// attempt, so a worker whose claim was recovered and re-claimed gets
    /// [`JobStoreError::StaleTransition`].
    async fn complete(&self, id: JobId, attempts_made: u32, result: Value) -> Result<Job, JobStoreError>;

    /// `active` → `waiting` with a new schedule. `attempts_made` must match
    /// the claimed attempt.
    async fn reschedule_for_retry(
        &self,
        id: JobId,
        attempts_made: u32,
        scheduled_for: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError>;

    /// `active` → `failed`.
    async fn mark_terminal_failed(
        &self,
        id: JobId,
        attempts_made: u32,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError>;

    /// Only applies to `active` jobs on the claimed attempt; `percent` is
    /// clamped to 100.
    async fn update_progress(&self, id: JobId, attempts_made: u32, percent: u8) -> Result<(), JobStoreError>;

    async fn counts_by_status(&self, queue: &QueueName) -> Result<JobCounts, JobStoreError>;

    /// Release `active` jobs whose current attempt started before
    /// `stalled_before`.
    async fn recover_stalled(
        &self,
        queue: &QueueName,
        stalled_before: DateTime<Utc>,
    ) -> Result<StalledRecovery, JobStoreError>;

    /// Delete terminal jobs that finished before the given cutoffs.
    async fn purge(
        &self,
        queue: &QueueName,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, JobStoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: NewJob) -> Result<Enqueued, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_batch(&self, queue: &QueueName, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(queue, limit).await
    }

    async fn complete(&self, id: JobId, attempts_made: u32, result: Value) -> Result<Job, JobStoreError> {
        (**self).complete(id, attempts_made, result).await
    }

    async fn reschedule_for_retry(
        &self,
        id: JobId,
        attempts_made: u32,
        scheduled_for: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        (**self).reschedule_for_retry(id, attempts_made, scheduled_for, failure).await
    }

    async fn mark_terminal_failed(
        &self,
        id: JobId,
        attempts_made: u32,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        (**self).mark_terminal_failed(id, attempts_made, failure).await
    }

    async fn update_progress(&self, id: JobId, attempts_made: u32, percent: u8) -> Result<(), JobStoreError> {
        (**self).update_progress(id, attempts_made, percent).await
    }

    async fn counts_by_status(&self, queue: &QueueName) -> Result<JobCounts, JobStoreError> {
        (**self).counts_by_status(queue).await
    }

    async fn recover_stalled(
        &self,
        queue: &QueueName,
        stalled_before: DateTime<Utc>,
    ) -> Result<StalledRecovery, JobStoreError> {
        (**self).recover_stalled(queue, stalled_before).await
    }

    async fn purge(
        &self,
        queue: &QueueName,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, JobStoreError> {
        (**self).purge(queue, completed_before, failed_before).await
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        (**self).ping().await
    }
}
