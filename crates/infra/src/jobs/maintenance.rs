//! Periodic housekeeping: stalled-job recovery and retention.
//!
//! Runs separately from workers. Workers never delete rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lendq_core::QueueName;
use lendq_events::{JobEvent, JobEventKind, ListenerSet};

use super::dead_letter::DeadLetterManager;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobFailure};

/// Age-based retention of terminal jobs. Dead-letter records are not
/// covered and are never purged here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max_age: Duration,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age: Duration::from_secs(24 * 3600),
            failed_max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// An `active` job whose attempt started longer ago than this is
    /// considered abandoned.
    pub stalled_timeout: Duration,
    pub retention: RetentionPolicy,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stalled_timeout: Duration::from_secs(15 * 60),
            retention: RetentionPolicy::default(),
        }
    }
}

impl MaintenanceConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stalled_timeout(mut self, timeout: Duration) -> Self {
        self.stalled_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// What one pass did, summed over all queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub purged_completed: u64,
    pub purged_failed: u64,
}

pub struct Maintenance {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<DeadLetterManager>,
    listeners: Arc<ListenerSet>,
    queues: Vec<QueueName>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: Arc<DeadLetterManager>,
        listeners: Arc<ListenerSet>,
        queues: Vec<QueueName>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            store,
            dead_letters,
            listeners,
            queues,
            config,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// One pass over every queue. A failing queue is logged and skipped.
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for queue in &self.queues {
            if let Err(err) = self.run_queue(queue, &mut report).await {
                warn!(queue = %queue, error = %err, "maintenance pass failed");
            }
        }
        if report != MaintenanceReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                purged_completed = report.purged_completed,
                purged_failed = report.purged_failed,
                "maintenance pass finished"
            );
        }
        report
    }

    async fn run_queue(&self, queue: &QueueName, report: &mut MaintenanceReport) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let stalled_before = now - to_chrono(self.config.stalled_timeout);
        let recovery = self.store.recover_stalled(queue, stalled_before).await?;

        for job in &recovery.requeued {
            report.requeued += 1;
            warn!(queue = %queue, job_id = %job.id, attempt = job.attempts_made, "stalled job returned to queue");
            self.emit(job, JobEventKind::Failed {
                attempt: job.attempts_made,
                error: "job stalled".to_string(),
                duration_ms: stalled_for_ms(job),
                will_retry: true,
            });
        }

        for job in &recovery.failed {
            report.failed += 1;
            let failure = JobFailure::new("job stalled");
            let duration_ms = stalled_for_ms(job);
            self.emit(job, JobEventKind::Failed {
                attempt: job.attempts_made,
                error: failure.message.clone(),
                duration_ms,
                will_retry: false,
            });
            let dead_lettered = self
                .dead_letters
                .move_to_dead_letter(job, &failure, Duration::from_millis(duration_ms))
                .await;
            if dead_lettered.is_some() {
                report.dead_lettered += 1;
                self.emit(job, JobEventKind::DeadLettered { reason: failure.message });
            }
        }

        let retention = self.config.retention;
        let purged = self
            .store
            .purge(
                queue,
                now - to_chrono(retention.completed_max_age),
                now - to_chrono(retention.failed_max_age),
            )
            .await?;
        report.purged_completed += purged.completed;
        report.purged_failed += purged.failed;
        Ok(())
    }

    /// Run passes every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                queues = ?self.queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
                interval_ms = self.config.interval.as_millis() as u64,
                "maintenance started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("maintenance stopped");
        })
    }

    fn emit(&self, job: &Job, kind: JobEventKind) {
        self.listeners
            .emit(&JobEvent::new(job.id, job.queue.clone(), job.name.clone(), kind));
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| {
        error!(seconds = d.as_secs(), "duration out of range; clamping to 100 years");
        chrono::Duration::days(36_500)
    })
}

fn stalled_for_ms(job: &Job) -> u64 {
    job.processed_at
        .map(|p| (Utc::now() - p).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}
