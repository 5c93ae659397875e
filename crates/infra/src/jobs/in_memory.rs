//! In-memory stores for tests and local development.
//!
//! Each operation runs under one write lock, which gives the same
//! single-step atomicity the PostgreSQL store gets from single statements.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use lendq_core::{JobId, QueueName};

use super::dead_letter::{DeadLetterCount, DeadLetterError, DeadLetterStore};
use super::store::{JobStore, JobStoreError, PurgeCounts, StalledRecovery};
use super::types::{DeadLetterRecord, Enqueued, Job, JobCounts, JobFailure, JobStatus, NewJob};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every operation fail with [`JobStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows in any state.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.check_available()?;
        self.jobs.read().map_err(|_| JobStoreError::unavailable("job map lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.check_available()?;
        self.jobs.write().map_err(|_| JobStoreError::unavailable("job map lock poisoned"))
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobStoreError::unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }
}

/// Look up an `active` job on the claimed attempt, or explain why not.
fn active_job<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    id: JobId,
    attempts_made: u32,
) -> Result<&'a mut Job, JobStoreError> {
    let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
    if job.status != JobStatus::Active || job.attempts_made != attempts_made {
        return Err(JobStoreError::StaleTransition(id));
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Enqueued, JobStoreError> {
        let mut jobs = self.write()?;

        if let Some(key) = &new.dedupe_key {
            let existing = jobs.values().find(|j| {
                j.queue == new.queue && j.dedupe_key.as_ref() == Some(key) && j.status != JobStatus::Failed
            });
            if let Some(existing) = existing {
                return Ok(Enqueued {
                    job: existing.clone(),
                    duplicate: true,
                });
            }
        }

        let job = Job::from_new(new);
        jobs.insert(job.id, job.clone());
        Ok(Enqueued { job, duplicate: false })
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim_batch(&self, queue: &QueueName, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| &j.queue == queue && j.is_claimable(now))
            .collect();
        candidates.sort_by(|a, b| Job::claim_order(a, b));
        let ids: Vec<JobId> = candidates.into_iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Active;
                job.attempts_made += 1;
                job.processed_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId, attempts_made: u32, result: Value) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = active_job(&mut jobs, id, attempts_made)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(result);
        job.progress = 100;
        Ok(job.clone())
    }

    async fn reschedule_for_retry(
        &self,
        id: JobId,
        attempts_made: u32,
        scheduled_for: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = active_job(&mut jobs, id, attempts_made)?;
        job.status = JobStatus::Waiting;
        job.scheduled_for = scheduled_for;
        job.error = Some(failure.message.clone());
        job.error_stack = failure.stack.clone();
        Ok(job.clone())
    }

    async fn mark_terminal_failed(
        &self,
        id: JobId,
        attempts_made: u32,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = active_job(&mut jobs, id, attempts_made)?;
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(failure.message.clone());
        job.error_stack = failure.stack.clone();
        Ok(job.clone())
    }

    async fn update_progress(&self, id: JobId, attempts_made: u32, percent: u8) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = active_job(&mut jobs, id, attempts_made)?;
        job.progress = percent.min(100);
        Ok(())
    }

    async fn counts_by_status(&self, queue: &QueueName) -> Result<JobCounts, JobStoreError> {
        let jobs = self.read()?;
        let now = Utc::now();
        let mut counts = JobCounts::default();
        for job in jobs.values().filter(|j| &j.queue == queue) {
            match job.status {
                JobStatus::Waiting if job.scheduled_for > now => counts.delayed += 1,
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn recover_stalled(
        &self,
        queue: &QueueName,
        stalled_before: DateTime<Utc>,
    ) -> Result<StalledRecovery, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut recovery = StalledRecovery::default();

        for job in jobs.values_mut() {
            let stalled = &job.queue == queue
                && job.status == JobStatus::Active
                && job.processed_at.is_some_and(|p| p < stalled_before);
            if !stalled {
                continue;
            }
            job.error = Some("job stalled".to_string());
            if job.attempts_exhausted() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                recovery.failed.push(job.clone());
            } else {
                job.status = JobStatus::Waiting;
                job.scheduled_for = now;
                recovery.requeued.push(job.clone());
            }
        }
        Ok(recovery)
    }

    async fn purge(
        &self,
        queue: &QueueName,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, JobStoreError> {
        let mut jobs = self.write()?;
        let mut counts = PurgeCounts::default();
        jobs.retain(|_, job| {
            if &job.queue != queue {
                return true;
            }
            let finished = job.completed_at.unwrap_or(job.created_at);
            match job.status {
                JobStatus::Completed if finished < completed_before => {
                    counts.completed += 1;
                    false
                }
                JobStatus::Failed if finished < failed_before => {
                    counts.failed += 1;
                    false
                }
                _ => true,
            }
        });
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        self.read().map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`DeadLetterError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), DeadLetterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        self.check_available()?;
        self.records
            .write()
            .map_err(|_| DeadLetterError::Unavailable("dead-letter lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }

    async fn list(&self, queue: Option<&QueueName>, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        self.check_available()?;
        let records = self
            .records
            .read()
            .map_err(|_| DeadLetterError::Unavailable("dead-letter lock poisoned".into()))?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| queue.is_none_or(|q| &r.original_queue == q))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts_by_queue(&self) -> Result<BTreeMap<String, DeadLetterCount>, DeadLetterError> {
        self.check_available()?;
        let records = self
            .records
            .read()
            .map_err(|_| DeadLetterError::Unavailable("dead-letter lock poisoned".into()))?;
        let mut counts: BTreeMap<String, DeadLetterCount> = BTreeMap::new();
        for record in records.iter() {
            let entry = counts.entry(record.original_queue.to_string()).or_default();
            entry.total += 1;
            if !record.investigated {
                entry.uninvestigated += 1;
            }
        }
        Ok(counts)
    }
}
