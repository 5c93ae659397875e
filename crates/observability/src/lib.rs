//! Tracing setup and in-process job metrics.

/// Initialize process-wide logging with JSON output and an `info` default.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

pub use tracing::{LogFormat, ParseLogFormatError, init_with};

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Per-queue counters, duration samples and alert predicates.
pub mod metrics;

pub use metrics::{AlertThresholds, MetricsRegistry, MetricsSnapshot, QueueAlerts};
