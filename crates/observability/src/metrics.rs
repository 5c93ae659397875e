use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use lendq_events::{JobEvent, JobEventKind, JobListener, ListenerError};
use serde::Serialize;
use tracing::warn;

/// Number of most recent processing durations kept per queue.
pub const DURATION_SAMPLE_WINDOW: usize = 1_000;

/// Levels at which a queue is flagged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Percentage; flagged when strictly above.
    pub failure_rate_percent: f64,
    /// Flagged when the rolling average is strictly above.
    pub avg_duration: Duration,
    /// Flagged when the dead-letter count reaches this value.
    pub dead_letter_size: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failure_rate_percent: 5.0,
            avg_duration: Duration::from_secs(30),
            dead_letter_size: 10,
        }
    }
}

impl AlertThresholds {
    pub fn with_failure_rate_percent(mut self, percent: f64) -> Self {
        self.failure_rate_percent = percent;
        self
    }

    pub fn with_avg_duration(mut self, d: Duration) -> Self {
        self.avg_duration = d;
        self
    }

    pub fn with_dead_letter_size(mut self, n: u64) -> Self {
        self.dead_letter_size = n;
        self
    }
}

/// Alert flags for one queue. Flags only; acting on them is up to whoever
/// reads the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueAlerts {
    pub high_failure_rate: bool,
    pub slow_processing: bool,
    pub dead_letter_backlog: bool,
}

impl QueueAlerts {
    pub fn evaluate(failure_rate: f64, avg_duration_ms: f64, dead_letter_size: u64, t: &AlertThresholds) -> Self {
        Self {
            high_failure_rate: failure_rate > t.failure_rate_percent,
            slow_processing: avg_duration_ms > t.avg_duration.as_millis() as f64,
            dead_letter_backlog: dead_letter_size >= t.dead_letter_size,
        }
    }

    pub fn any(&self) -> bool {
        self.high_failure_rate || self.slow_processing || self.dead_letter_backlog
    }
}

/// `failed / (failed + completed) * 100`, or 0 with no outcomes yet.
pub fn failure_rate(completed: u64, failed: u64) -> f64 {
    let outcomes = completed + failed;
    if outcomes == 0 {
        return 0.0;
    }
    failed as f64 / outcomes as f64 * 100.0
}

pub fn average_ms(samples: &VecDeque<u64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub queue: String,
    /// Attempts started.
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    /// Failed attempts, including ones that were retried.
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub failure_rate: f64,
    pub dead_letter_size: u64,
    pub alerts: QueueAlerts,
}

#[derive(Debug, Default)]
struct QueueMetrics {
    total: u64,
    active: u64,
    completed: u64,
    failed: u64,
    durations: VecDeque<u64>,
    dead_letter_size: u64,
    alerts: QueueAlerts,
}

impl QueueMetrics {
    fn push_duration(&mut self, ms: u64) {
        if self.durations.len() == DURATION_SAMPLE_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(ms);
    }

    fn apply(&mut self, kind: &JobEventKind) {
        match kind {
            JobEventKind::Active { .. } => {
                self.total += 1;
                self.active += 1;
            }
            JobEventKind::Completed { duration_ms } => {
                self.active = self.active.saturating_sub(1);
                self.completed += 1;
                self.push_duration(*duration_ms);
            }
            JobEventKind::Failed { duration_ms, .. } => {
                self.active = self.active.saturating_sub(1);
                self.failed += 1;
                self.push_duration(*duration_ms);
            }
            JobEventKind::DeadLettered { .. } => self.dead_letter_size += 1,
            JobEventKind::Waiting | JobEventKind::Progress { .. } => {}
        }
    }

    fn snapshot(&self, queue: &str, thresholds: &AlertThresholds) -> MetricsSnapshot {
        let failure_rate = failure_rate(self.completed, self.failed);
        let avg_duration_ms = average_ms(&self.durations);
        MetricsSnapshot {
            queue: queue.to_string(),
            total: self.total,
            active: self.active,
            completed: self.completed,
            failed: self.failed,
            avg_duration_ms,
            failure_rate,
            dead_letter_size: self.dead_letter_size,
            alerts: QueueAlerts::evaluate(failure_rate, avg_duration_ms, self.dead_letter_size, thresholds),
        }
    }
}

/// Per-queue metrics aggregator, fed by job lifecycle events.
///
/// Register it on the job system's listener set. Each time an alert flag
/// turns on, a `warn!` is logged once; it is logged again only after the
/// flag has cleared and tripped anew.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    thresholds: AlertThresholds,
    queues: Mutex<BTreeMap<String, QueueMetrics>>,
}

impl MetricsRegistry {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn record(&self, event: &JobEvent) -> Result<(), ListenerError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| ListenerError::failed("metrics lock poisoned"))?;
        let queue = event.queue.as_str();
        let metrics = queues.entry(queue.to_string()).or_default();
        metrics.apply(&event.kind);
        self.check_alerts(queue, metrics);
        Ok(())
    }

    /// Seed the dead-letter count from the store, e.g. at startup.
    pub fn set_dead_letter_size(&self, queue: &str, size: u64) {
        if let Ok(mut queues) = self.queues.lock() {
            let metrics = queues.entry(queue.to_string()).or_default();
            metrics.dead_letter_size = size;
            self.check_alerts(queue, metrics);
        }
    }

    pub fn snapshot(&self, queue: &str) -> Option<MetricsSnapshot> {
        let queues = self.queues.lock().ok()?;
        queues.get(queue).map(|m| m.snapshot(queue, &self.thresholds))
    }

    /// Snapshots of every queue seen so far, ordered by queue name.
    pub fn all(&self) -> Vec<MetricsSnapshot> {
        match self.queues.lock() {
            Ok(queues) => queues
                .iter()
                .map(|(name, m)| m.snapshot(name, &self.thresholds))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn reset(&self, queue: &str) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.remove(queue);
        }
    }

    fn check_alerts(&self, queue: &str, metrics: &mut QueueMetrics) {
        let snap = metrics.snapshot(queue, &self.thresholds);
        let before = metrics.alerts;
        let now = snap.alerts;

        if now.high_failure_rate && !before.high_failure_rate {
            warn!(
                queue,
                failure_rate = snap.failure_rate,
                threshold = self.thresholds.failure_rate_percent,
                "high failure rate"
            );
        }
        if now.slow_processing && !before.slow_processing {
            warn!(
                queue,
                avg_duration_ms = snap.avg_duration_ms,
                threshold_ms = self.thresholds.avg_duration.as_millis() as u64,
                "slow job processing"
            );
        }
        if now.dead_letter_backlog && !before.dead_letter_backlog {
            warn!(
                queue,
                dead_letter_size = snap.dead_letter_size,
                threshold = self.thresholds.dead_letter_size,
                "dead-letter backlog"
            );
        }
        metrics.alerts = now;
    }
}

impl JobListener for MetricsRegistry {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError> {
        self.record(event)
    }
}
