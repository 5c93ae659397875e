//! Health report for an external telemetry collector.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use lendq_core::QueueName;
use lendq_observability::{MetricsRegistry, MetricsSnapshot, QueueAlerts};

use super::dead_letter::{DeadLetterManager, DeadLetterStats};
use super::store::JobStore;
use super::types::JobCounts;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueHealth {
    pub counts: Option<JobCounts>,
    pub metrics: Option<MetricsSnapshot>,
    pub alerts: QueueAlerts,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// False when either store is unreachable. Alerts do not affect it.
    pub healthy: bool,
    pub generated_at: DateTime<Utc>,
    pub queues: BTreeMap<String, QueueHealth>,
    pub dead_letter: DeadLetterStats,
}

impl HealthReport {
    pub fn alerting_queues(&self) -> Vec<&str> {
        self.queues
            .iter()
            .filter(|(_, q)| q.alerts.any())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub struct HealthService {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<DeadLetterManager>,
    metrics: Arc<MetricsRegistry>,
    queues: Vec<QueueName>,
}

impl HealthService {
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: Arc<DeadLetterManager>,
        metrics: Arc<MetricsRegistry>,
        queues: Vec<QueueName>,
    ) -> Self {
        Self {
            store,
            dead_letters,
            metrics,
            queues,
        }
    }

    /// Collect counts, metrics and dead-letter stats. Dead-letter counts
    /// from the store refresh the metrics registry so its backlog alert
    /// reflects records written by other processes too.
    pub async fn report(&self) -> HealthReport {
        let dead_letter = self.dead_letters.get_stats().await;
        let mut healthy = dead_letter.healthy;

        if let Err(err) = self.store.ping().await {
            warn!(error = %err, "job store unreachable");
            healthy = false;
        }

        let mut queues = BTreeMap::new();
        for queue in &self.queues {
            if dead_letter.healthy {
                let size = dead_letter
                    .counts_by_queue
                    .get(queue.as_str())
                    .map(|c| c.total)
                    .unwrap_or(0);
                self.metrics.set_dead_letter_size(queue.as_str(), size);
            }

            let (counts, error) = match self.store.counts_by_status(queue).await {
                Ok(c) => (Some(c), None),
                Err(err) => {
                    healthy = false;
                    (None, Some(err.to_string()))
                }
            };
            let metrics = self.metrics.snapshot(queue.as_str());
            let alerts = metrics.as_ref().map(|m| m.alerts).unwrap_or_default();
            queues.insert(
                queue.to_string(),
                QueueHealth {
                    counts,
                    metrics,
                    alerts,
                    error,
                },
            );
        }

        HealthReport {
            healthy,
            generated_at: Utc::now(),
            queues,
            dead_letter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::{InMemoryDeadLetterStore, InMemoryJobStore};
    use crate::jobs::types::{InstanceInfo, Job, JobFailure, JobOptions, JobStatus, DefaultJobOptions, NewJob};
    use lendq_observability::AlertThresholds;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        dlq: Arc<InMemoryDeadLetterStore>,
        manager: Arc<DeadLetterManager>,
        service: HealthService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let dlq = Arc::new(InMemoryDeadLetterStore::new());
        let manager = Arc::new(DeadLetterManager::new(dlq.clone(), InstanceInfo::default()));
        let metrics = Arc::new(MetricsRegistry::new(AlertThresholds::default().with_dead_letter_size(1)));
        let service = HealthService::new(
            store.clone(),
            manager.clone(),
            metrics,
            vec![QueueName::new("payments").unwrap()],
        );
        Fixture {
            store,
            dlq,
            manager,
            service,
        }
    }

    #[tokio::test]
    async fn healthy_report_includes_counts_and_dead_letter_alert() {
        let fx = fixture();
        let mut job = Job::from_new(
            NewJob::build(
                QueueName::new("payments").unwrap(),
                "pay",
                json!({}),
                JobOptions::new(),
                &DefaultJobOptions::default(),
            )
            .unwrap(),
        );
        job.status = JobStatus::Failed;
        fx.manager
            .move_to_dead_letter(&job, &JobFailure::new("x"), Duration::ZERO)
            .await;

        let report = fx.service.report().await;
        assert!(report.healthy);
        let payments = &report.queues["payments"];
        assert_eq!(payments.counts, Some(JobCounts::default()));
        assert!(payments.alerts.dead_letter_backlog);
        assert_eq!(report.alerting_queues(), vec!["payments"]);
        assert_eq!(report.dead_letter.total(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["healthy"], true);
    }

    #[tokio::test]
    async fn unreachable_stores_make_report_unhealthy() {
        let fx = fixture();
        fx.dlq.set_unavailable(true);
        let report = fx.service.report().await;
        assert!(!report.healthy);
        assert!(!report.dead_letter.healthy);

        fx.dlq.set_unavailable(false);
        fx.store.set_unavailable(true);
        let report = fx.service.report().await;
        assert!(!report.healthy);
        assert!(report.queues["payments"].error.is_some());
    }
}
