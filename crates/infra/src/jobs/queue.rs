//! Per-queue enqueue/inspect API.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use lendq_core::{DomainError, JobId, JobPayload, QueueName};
use lendq_events::{JobEvent, JobEventKind, ListenerSet};

use super::store::{JobStore, JobStoreError};
use super::types::{DefaultJobOptions, Enqueued, Job, JobCounts, JobOptions, NewJob};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Bad enqueue input. Nothing was written.
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl QueueError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Handle to one named queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    name: QueueName,
    store: Arc<dyn JobStore>,
    defaults: DefaultJobOptions,
    listeners: Arc<ListenerSet>,
}

impl Queue {
    pub fn new(name: QueueName, store: Arc<dyn JobStore>, listeners: Arc<ListenerSet>) -> Self {
        Self {
            name,
            store,
            defaults: DefaultJobOptions::default(),
            listeners,
        }
    }

    pub fn with_defaults(mut self, defaults: DefaultJobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn defaults(&self) -> &DefaultJobOptions {
        &self.defaults
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn listeners(&self) -> &Arc<ListenerSet> {
        &self.listeners
    }

    /// Enqueue a job.
    ///
    /// With a dedupe key, concurrent calls create at most one job; every
    /// caller gets the same id and all but the creator see
    /// `duplicate = true`. A duplicate is a success, not an error.
    pub async fn add(&self, job_name: &str, data: Value, options: JobOptions) -> Result<Enqueued, QueueError> {
        let new = NewJob::build(self.name.clone(), job_name, data, options, &self.defaults)?;
        let enqueued = self.store.insert(new).await?;
        let job = &enqueued.job;

        if enqueued.duplicate {
            info!(
                queue = %self.name,
                job_id = %job.id,
                job_name = %job.name,
                dedupe_key = job.dedupe_key.as_ref().map(|k| k.as_str()).unwrap_or(""),
                status = %job.status,
                "duplicate enqueue; returning existing job"
            );
        } else {
            debug!(
                queue = %self.name,
                job_id = %job.id,
                job_name = %job.name,
                priority = job.priority,
                max_attempts = job.max_attempts,
                scheduled_for = %job.scheduled_for,
                "job enqueued"
            );
            self.emit(job, JobEventKind::Waiting);
        }
        Ok(enqueued)
    }

    /// Enqueue a typed payload. The payload must be bound to this queue.
    /// Its `dedupe_key` and `correlation_id` apply unless `options` sets
    /// them.
    pub async fn add_typed<P: JobPayload>(&self, payload: &P, mut options: JobOptions) -> Result<Enqueued, QueueError> {
        if P::QUEUE != self.name.as_str() {
            return Err(DomainError::validation(format!(
                "payload '{}' belongs to queue '{}', not '{}'",
                P::JOB_NAME,
                P::QUEUE,
                self.name
            ))
            .into());
        }
        payload.validate()?;

        if options.dedupe_key.is_none() {
            options.dedupe_key = payload.dedupe_key();
        }
        if options.correlation_id.is_none() {
            options.correlation_id = payload.correlation_id();
        }
        let data = serde_json::to_value(payload)
            .map_err(|e| DomainError::validation(format!("payload is not serializable: {e}")))?;

        self.add(P::JOB_NAME, data, options).await
    }

    /// A job of this queue, or `None` if it does not exist here.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let job = self.store.get(id).await?;
        Ok(job.filter(|j| j.queue == self.name))
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        Ok(self.store.counts_by_status(&self.name).await?)
    }

    /// Record progress on the claimed attempt of `job` and notify listeners.
    pub async fn update_progress(&self, job: &Job, percent: u8) -> Result<(), QueueError> {
        let percent = percent.min(100);
        self.store.update_progress(job.id, job.attempts_made, percent).await?;
        self.emit(job, JobEventKind::Progress { percent });
        Ok(())
    }

    pub(crate) fn emit(&self, job: &Job, kind: JobEventKind) {
        self.listeners
            .emit(&JobEvent::new(job.id, job.queue.clone(), job.name.clone(), kind));
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}
