//! Durable job queue with retry, backoff and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs live in a relational store; the store is the only coordination
//!   point between workers (claims are atomic and never double-assign)
//! - Delivery is at-least-once: a claimed job is completed, rescheduled or
//!   terminally failed; stalled claims are recovered by maintenance
//! - Exhausted jobs are copied to a separate dead-letter store; a failed
//!   dead-letter write is logged and never stops a worker
//! - Lifecycle events fan out to listeners (metrics, event bus)
//!
//! ## Components
//!
//! - [`JobStore`]: persistence (in-memory or Postgres)
//! - [`Queue`]: producer API with dedupe and option validation
//! - [`Worker`]: bounded-concurrency poller executing registered processors
//! - [`retry`]: backoff policy and the retry-or-dead-letter decision
//! - [`DeadLetterManager`]: audit trail of exhausted jobs
//! - [`Maintenance`]: stalled-job recovery and retention
//! - [`HealthService`]: queue counts, metrics, alerts and store health

pub mod dead_letter;
pub mod health;
pub mod in_memory;
pub mod maintenance;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;
pub mod worker;

pub use dead_letter::{DeadLetterCount, DeadLetterError, DeadLetterManager, DeadLetterStats, DeadLetterStore};
pub use health::{HealthReport, HealthService, QueueHealth};
pub use in_memory::{InMemoryDeadLetterStore, InMemoryJobStore};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport, RetentionPolicy};
pub use postgres::{PostgresDeadLetterStore, PostgresJobStore};
pub use processor::{FnProcessor, JobContext, Processor, ProcessorRegistry, TypedProcessor};
pub use queue::{Queue, QueueError};
pub use retry::{BackoffKind, BackoffPolicy, RetryDecision};
pub use store::{JobStore, JobStoreError, PurgeCounts, StalledRecovery};
pub use types::{
    DeadLetterRecord, DefaultJobOptions, Enqueued, InstanceInfo, Job, JobCounts, JobFailure, JobOptions, JobStatus,
    NewJob,
};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats};
