//! Dead-letter store and manager.
//!
//! The dead-letter store is separate from the job table so that audit
//! writes never contend with the hot claim path. A dead-letter write
//! failure degrades observability only; [`DeadLetterManager`] logs it and
//! carries on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use lendq_core::{DeadLetterId, QueueName};

use super::types::{DeadLetterRecord, InstanceInfo, Job, JobFailure};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt dead-letter record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterCount {
    pub total: u64,
    pub uninvestigated: u64,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append a record. Records are never updated by this crate.
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;

    /// Newest first, optionally restricted to one originating queue.
    async fn list(&self, queue: Option<&QueueName>, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    /// Counts keyed by originating queue name.
    async fn counts_by_queue(&self) -> Result<BTreeMap<String, DeadLetterCount>, DeadLetterError>;
}

/// Read-side summary for health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterStats {
    /// False when the store could not be read.
    pub healthy: bool,
    pub counts_by_queue: BTreeMap<String, DeadLetterCount>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl DeadLetterStats {
    pub fn total(&self) -> u64 {
        self.counts_by_queue.values().map(|c| c.total).sum()
    }
}

pub struct DeadLetterManager {
    store: Arc<dyn DeadLetterStore>,
    instance: InstanceInfo,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn DeadLetterStore>, instance: InstanceInfo) -> Self {
        Self { store, instance }
    }

    pub fn instance(&self) -> &InstanceInfo {
        &self.instance
    }

    pub fn should_dead_letter(job: &Job) -> bool {
        job.attempts_exhausted()
    }

    /// Write the dead-letter record for `job`.
    ///
    /// Never fails: a store error is logged at critical severity and `None`
    /// is returned.
    pub async fn move_to_dead_letter(
        &self,
        job: &Job,
        failure: &JobFailure,
        processing: Duration,
    ) -> Option<DeadLetterId> {
        let record = DeadLetterRecord::from_job(job, failure, processing, &self.instance);

        match self.store.insert(&record).await {
            Ok(()) => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    job_name = %job.name,
                    dead_letter_id = %record.id,
                    attempts = job.attempts_made,
                    max_attempts = job.max_attempts,
                    correlation_id = job.correlation_id.as_deref().unwrap_or(""),
                    error = %failure.message,
                    "job moved to dead-letter queue"
                );
                Some(record.id)
            }
            Err(err) => {
                error!(
                    severity = "critical",
                    queue = %job.queue,
                    job_id = %job.id,
                    job_name = %job.name,
                    error = %err,
                    job_error = %failure.message,
                    "failed to write dead-letter record"
                );
                None
            }
        }
    }

    pub async fn get_stats(&self) -> DeadLetterStats {
        match self.store.counts_by_queue().await {
            Ok(counts_by_queue) => DeadLetterStats {
                healthy: true,
                counts_by_queue,
                error: None,
                checked_at: Utc::now(),
            },
            Err(err) => {
                error!(error = %err, "dead-letter stats unavailable");
                DeadLetterStats {
                    healthy: false,
                    counts_by_queue: BTreeMap::new(),
                    error: Some(err.to_string()),
                    checked_at: Utc::now(),
                }
            }
        }
    }

    pub async fn list(
        &self,
        queue: Option<&QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let records = self.store.list(queue, limit).await?;
        info!(count = records.len(), "listed dead-letter records");
        Ok(records)
    }
}

impl std::fmt::Debug for DeadLetterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterManager").field("instance", &self.instance).finish()
    }
}
