//! Queue worker: polls, claims, runs processors, applies outcomes.
//!
//! One worker serves one queue. The poll loop is the only place that calls
//! `claim_batch`; each claimed job runs on its own task, up to
//! `concurrency` at a time. Processing errors and panics are contained
//! here and turned into retry or dead-letter transitions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lendq_core::{DomainError, JobPayload, QueueName};
use lendq_events::JobEventKind;

use super::dead_letter::DeadLetterManager;
use super::processor::{FnProcessor, JobContext, Processor, ProcessorRegistry, TypedProcessor};
use super::queue::Queue;
use super::retry::RetryDecision;
use super::store::JobStoreError;
use super::types::{Job, JobFailure};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    pub poll_interval: Duration,
    /// Maximum jobs running at once.
    pub concurrency: usize,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(2),
            concurrency: 1,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.concurrency == 0 {
            return Err(DomainError::validation("worker concurrency must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(DomainError::validation("worker poll interval must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] DomainError),
    #[error("no processors registered for queue '{0}'")]
    NoProcessors(QueueName),
    #[error("shutdown timed out after {timeout:?}; aborted {in_flight} running job(s)")]
    ShutdownTimeout { timeout: Duration, in_flight: usize },
    #[error("worker task failed: {0}")]
    Task(String),
}

/// Counters since the worker started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Attempts finished, whatever the outcome.
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Attempts currently running.
    pub running: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    running: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

pub struct Worker {
    queue: Queue,
    config: WorkerConfig,
    processors: ProcessorRegistry,
    dead_letters: Arc<DeadLetterManager>,
    stats: Arc<StatsCounters>,
}

impl Worker {
    pub fn new(queue: Queue, dead_letters: Arc<DeadLetterManager>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            processors: ProcessorRegistry::new(),
            dead_letters,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn register_processor(
        &mut self,
        job_name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Result<&mut Self, WorkerError> {
        self.processors.register(job_name, processor)?;
        Ok(self)
    }

    /// Register an async closure for `job_name` (or a `prefix.*` / `*`
    /// pattern).
    pub fn register<F, Fut>(&mut self, job_name: impl Into<String>, f: F) -> Result<&mut Self, WorkerError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_processor(job_name, Arc::new(FnProcessor::new(f)))
    }

    /// Register a closure for payload type `P`, which must belong to this
    /// worker's queue.
    pub fn register_typed<P, F, Fut>(&mut self, f: F) -> Result<&mut Self, WorkerError>
    where
        P: JobPayload,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if P::QUEUE != self.queue.name().as_str() {
            return Err(DomainError::validation(format!(
                "payload '{}' belongs to queue '{}', not '{}'",
                P::JOB_NAME,
                P::QUEUE,
                self.queue.name()
            ))
            .into());
        }
        self.register_processor(P::JOB_NAME, Arc::new(TypedProcessor::<P, F, Fut>::new(f)))
    }

    /// Claim one batch (up to `concurrency` jobs) and run it to completion,
    /// one job after another. Returns the number of jobs claimed.
    pub async fn poll_once(&self) -> Result<usize, JobStoreError> {
        let jobs = self
            .queue
            .store()
            .claim_batch(self.queue.name(), self.config.concurrency)
            .await?;
        let claimed = jobs.len();
        for job in jobs {
            self.execute(job).await;
        }
        Ok(claimed)
    }

    /// Start the poll loop on the current tokio runtime.
    pub fn spawn(self) -> Result<WorkerHandle, WorkerError> {
        self.spawn_with_token(CancellationToken::new())
    }

    /// Like [`Worker::spawn`], stopping when `cancel` is cancelled.
    pub fn spawn_with_token(self, cancel: CancellationToken) -> Result<WorkerHandle, WorkerError> {
        self.config.validate()?;
        if self.processors.is_empty() {
            return Err(WorkerError::NoProcessors(self.queue.name().clone()));
        }

        let queue = self.queue.name().clone();
        let stats = self.stats.clone();
        let worker = Arc::new(self);
        let join = tokio::spawn(worker.run(cancel.clone()));

        Ok(WorkerHandle {
            queue,
            cancel,
            join,
            stats,
        })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), WorkerError> {
        let queue = self.queue.name().clone();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            queue = %queue,
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            processors = ?self.processors.names(),
            "worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(&queue, joined);
                }
                _ = interval.tick() => {
                    let free = self.config.concurrency.saturating_sub(in_flight.len());
                    if free > 0 {
                        match self.queue.store().claim_batch(&queue, free).await {
                            Ok(jobs) => {
                                if !jobs.is_empty() {
                                    debug!(queue = %queue, claimed = jobs.len(), "claimed jobs");
                                }
                                for job in jobs {
                                    let worker = Arc::clone(&self);
                                    in_flight.spawn(async move { worker.execute(job).await });
                                }
                            }
                            Err(err) => {
                                warn!(queue = %queue, error = %err, "claim failed; retrying on next poll");
                            }
                        }
                    }
                }
            }
        }

        info!(queue = %queue, in_flight = in_flight.len(), "worker stopping; draining in-flight jobs");

        let timeout = self.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(&queue, joined);
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!(queue = %queue, "worker stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = in_flight.len();
                in_flight.abort_all();
                // Reap the cancelled tasks so their guards have run on return.
                while in_flight.join_next().await.is_some() {}
                error!(
                    queue = %queue,
                    in_flight = remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker shutdown timed out; aborted running jobs"
                );
                Err(WorkerError::ShutdownTimeout {
                    timeout,
                    in_flight: remaining,
                })
            }
        }
    }

    async fn execute(&self, job: Job) {
        let _running = RunningGuard::enter(&self.stats);
        self.queue.emit(&job, JobEventKind::Active {
            attempt: job.attempts_made,
        });

        let started = Instant::now();
        let outcome = self.invoke(&job).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => self.succeed(&job, result, elapsed).await,
            Err(failure) => self.fail(&job, failure, elapsed).await,
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn invoke(&self, job: &Job) -> Result<Value, JobFailure> {
        let Some(processor) = self.processors.resolve(&job.name) else {
            return Err(JobFailure::new(format!("no processor registered for job '{}'", job.name)));
        };
        let ctx = JobContext::new(job.clone(), self.queue.clone());

        // Own task, so a panic comes back as a JoinError instead of
        // unwinding through the worker. Aborted with the outer task.
        match AbortOnDrop(tokio::spawn(async move { processor.process(ctx).await })).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JobFailure::from_error(&err)),
            Err(join_err) if join_err.is_panic() => Err(JobFailure::from_panic(join_err.into_panic())),
            Err(join_err) => Err(JobFailure::new(format!("processor task cancelled: {join_err}"))),
        }
    }

    async fn succeed(&self, job: &Job, result: Value, elapsed: Duration) {
        let duration_ms = millis(elapsed);
        match self.queue.store().complete(job.id, job.attempts_made, result).await {
            Ok(done) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    job_name = %job.name,
                    attempt = job.attempts_made,
                    duration_ms,
                    "job completed"
                );
                self.queue.emit(&done, JobEventKind::Completed { duration_ms });
            }
            Err(err) => error!(
                queue = %job.queue,
                job_id = %job.id,
                error = %err,
                "failed to record completion; job stays active until stalled-job recovery"
            ),
        }
    }

    async fn fail(&self, job: &Job, failure: JobFailure, elapsed: Duration) {
        let duration_ms = millis(elapsed);
        let attempt = job.attempts_made;
        let store = self.queue.store();

        match RetryDecision::decide(attempt, job.max_attempts, &job.backoff, Utc::now()) {
            RetryDecision::Retry { delay, at } => {
                match store.reschedule_for_retry(job.id, attempt, at, &failure).await {
                    Ok(updated) => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            queue = %job.queue,
                            job_id = %job.id,
                            job_name = %job.name,
                            attempt,
                            max_attempts = job.max_attempts,
                            retry_in_ms = millis(delay),
                            error = %failure.message,
                            "job failed; retry scheduled"
                        );
                        self.queue.emit(&updated, JobEventKind::Failed {
                            attempt,
                            error: failure.message,
                            duration_ms,
                            will_retry: true,
                        });
                    }
                    Err(err) => error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        error = %err,
                        job_error = %failure.message,
                        "failed to reschedule job"
                    ),
                }
            }
            RetryDecision::DeadLetter => {
                match store.mark_terminal_failed(job.id, attempt, &failure).await {
                    Ok(failed) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        self.queue.emit(&failed, JobEventKind::Failed {
                            attempt,
                            error: failure.message.clone(),
                            duration_ms,
                            will_retry: false,
                        });
                        if self.dead_letters.move_to_dead_letter(&failed, &failure, elapsed).await.is_some() {
                            self.queue.emit(&failed, JobEventKind::DeadLettered {
                                reason: failure.message,
                            });
                        }
                    }
                    Err(err) => error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        error = %err,
                        job_error = %failure.message,
                        "failed to mark job as failed"
                    ),
                }
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", self.queue.name())
            .field("config", &self.config)
            .field("processors", &self.processors)
            .finish()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Counts an attempt as running until dropped, including when the task
/// running it is aborted.
struct RunningGuard<'a>(&'a StatsCounters);

impl<'a> RunningGuard<'a> {
    fn enter(stats: &'a StatsCounters) -> Self {
        stats.running.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Join handle that aborts its task when dropped unfinished.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn log_join(queue: &QueueName, joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(queue = %queue, error = %err, "job task ended abnormally");
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: QueueName,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), WorkerError>>,
    stats: Arc<StatsCounters>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop claiming, wait for running jobs (up to the shutdown timeout),
    /// then return.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.cancel.cancel();
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(WorkerError::Task(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::{InMemoryDeadLetterStore, InMemoryJobStore};
    use crate::jobs::retry::BackoffPolicy;
    use crate::jobs::store::JobStore;
    use crate::jobs::types::{InstanceInfo, JobOptions, JobStatus};
    use lendq_events::ListenerSet;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        worker: Worker,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let queue = Queue::new(
            QueueName::new("payments").unwrap(),
            store.clone(),
            Arc::new(ListenerSet::new()),
        );
        let manager = Arc::new(DeadLetterManager::new(dead_letters.clone(), InstanceInfo::default()));
        Fixture {
            store,
            dead_letters,
            worker: Worker::new(queue, manager, config),
        }
    }

    async fn decline(_ctx: JobContext) -> anyhow::Result<Value> {
        anyhow::bail!("declined")
    }

    async fn explode(_ctx: JobContext) -> anyhow::Result<Value> {
        panic!("processor bug")
    }

    fn no_backoff(attempts: u32) -> JobOptions {
        JobOptions::new()
            .with_attempts(attempts)
            .with_backoff(BackoffPolicy::fixed(Duration::ZERO))
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let mut fx = fixture(WorkerConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        fx.worker
            .register("pay-proposal", move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        anyhow::bail!("bank timeout #{n}");
                    }
                    anyhow::Ok(json!({"paid": true}))
                }
            })
            .unwrap();

        let id = fx.worker.queue().add("pay-proposal", json!({}), no_backoff(3)).await.unwrap().job.id;
        for _ in 0..3 {
            assert_eq!(fx.worker.poll_once().await.unwrap(), 1);
        }

        let job = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.result, Some(json!({"paid": true})));
        assert!(fx.dead_letters.is_empty());

        let stats = fx.worker.stats();
        assert_eq!((stats.processed, stats.succeeded, stats.retried), (3, 1, 2));
    }

    #[tokio::test]
    async fn single_attempt_failure_dead_letters_once() {
        let mut fx = fixture(WorkerConfig::default());
        fx.worker
            .register("pay-proposal", decline)
            .unwrap();

        let id = fx.worker.queue().add("pay-proposal", json!({}), no_backoff(1)).await.unwrap().job.id;
        fx.worker.poll_once().await.unwrap();

        let job = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.error.as_deref(), Some("declined"));
        assert_eq!(fx.dead_letters.len(), 1);
        assert_eq!(fx.worker.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_is_scheduled_with_backoff() {
        let mut fx = fixture(WorkerConfig::default());
        fx.worker
            .register("pay-proposal", decline)
            .unwrap();

        let options = JobOptions::new().with_backoff(BackoffPolicy::exponential(Duration::from_secs(60)));
        let id = fx.worker.queue().add("pay-proposal", json!({}), options).await.unwrap().job.id;
        let before = Utc::now();
        fx.worker.poll_once().await.unwrap();

        let job = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.scheduled_for >= before + chrono::Duration::seconds(59));
        assert_eq!(fx.worker.poll_once().await.unwrap(), 0);
        assert_eq!(fx.worker.queue().counts().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn panics_and_missing_processors_are_failures() {
        let mut fx = fixture(WorkerConfig::default().with_concurrency(4));
        fx.worker
            .register("explode", explode)
            .unwrap();

        let q = fx.worker.queue().clone();
        let exploded = q.add("explode", json!({}), no_backoff(1)).await.unwrap().job.id;
        let orphan = q.add("unknown", json!({}), no_backoff(1)).await.unwrap().job.id;
        assert_eq!(fx.worker.poll_once().await.unwrap(), 2);

        let exploded = fx.store.get(exploded).await.unwrap().unwrap();
        assert_eq!(exploded.status, JobStatus::Failed);
        assert!(exploded.error.unwrap().contains("processor bug"));

        let orphan = fx.store.get(orphan).await.unwrap().unwrap();
        assert_eq!(orphan.error.as_deref(), Some("no processor registered for job 'unknown'"));
        assert_eq!(fx.dead_letters.len(), 2);
    }

    #[tokio::test]
    async fn dead_letter_outage_does_not_stop_processing() {
        let mut fx = fixture(WorkerConfig::default());
        fx.dead_letters.set_unavailable(true);
        fx.worker
            .register("pay-proposal", |ctx| async move {
                if ctx.data()["fail"] == json!(true) {
                    anyhow::bail!("declined");
                }
                anyhow::Ok(json!(null))
            })
            .unwrap();

        let q = fx.worker.queue().clone();
        let failing = q.add("pay-proposal", json!({"fail": true}), no_backoff(1)).await.unwrap().job.id;
        fx.worker.poll_once().await.unwrap();
        let ok = q.add("pay-proposal", json!({"fail": false}), no_backoff(1)).await.unwrap().job.id;
        fx.worker.poll_once().await.unwrap();

        assert_eq!(fx.store.get(failing).await.unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(fx.store.get(ok).await.unwrap().unwrap().status, JobStatus::Completed);
        assert!(fx.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn spawned_worker_processes_and_shuts_down() {
        let config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_concurrency(2);
        let mut fx = fixture(config);
        fx.worker
            .register("pay-proposal", |_ctx| async { anyhow::Ok(json!("done")) })
            .unwrap();
        let q = fx.worker.queue().clone();
        for i in 0..5 {
            q.add("pay-proposal", json!({"i": i}), JobOptions::new()).await.unwrap();
        }

        let handle = fx.worker.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while q.counts().await.unwrap().completed < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(q.counts().await.unwrap().completed, 5);
        assert_eq!(handle.stats().succeeded, 5);
        handle.shutdown().await.unwrap();
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn shutdown_times_out_on_hung_job() {
        let config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_millis(50));
        let mut fx = fixture(config);
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        fx.worker
            .register("hang", move |_ctx| {
                let flag = flag.clone();
                async move {
                    let _alive = SetOnDrop(flag);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    anyhow::Ok(json!(null))
                }
            })
            .unwrap();
        let q = fx.worker.queue().clone();
        q.add("hang", json!({}), JobOptions::new()).await.unwrap();

        let handle = fx.worker.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().running == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().running, 1);

        handle.cancellation_token().cancel();
        while !handle.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().running, 0);

        match handle.shutdown().await {
            Err(WorkerError::ShutdownTimeout { in_flight, .. }) => assert_eq!(in_flight, 1),
            other => panic!("expected shutdown timeout, got {other:?}"),
        }

        // The processor itself is stopped, not left running detached.
        while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(q.counts().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn late_completion_after_reclaim_is_discarded() {
        let mut fx = fixture(WorkerConfig::default());
        fx.worker
            .register("pay-proposal", |_ctx| async { anyhow::Ok(json!({"paid": true})) })
            .unwrap();
        let q = fx.worker.queue().clone();
        let id = q.add("pay-proposal", json!({}), JobOptions::new()).await.unwrap().job.id;

        // A worker claimed attempt 1 and went quiet; recovery handed the job
        // to another claim (attempt 2) that is still running.
        let stale = fx.store.claim_batch(q.name(), 1).await.unwrap().remove(0);
        let later = Utc::now() + chrono::Duration::seconds(1);
        fx.store.recover_stalled(q.name(), later).await.unwrap();
        let live = fx.store.claim_batch(q.name(), 1).await.unwrap().remove(0);
        assert_eq!(live.attempts_made, 2);

        fx.worker.execute(stale).await;

        let job = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts_made, 2);
        assert!(job.result.is_none());
        assert_eq!(fx.worker.stats().succeeded, 0);

        fx.worker.execute(live).await;
        let job = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"paid": true})));
    }

    #[tokio::test]
    async fn spawn_validates_setup() {
        let fx = fixture(WorkerConfig::default());
        assert!(matches!(fx.worker.spawn(), Err(WorkerError::NoProcessors(_))));

        let mut fx = fixture(WorkerConfig::default().with_concurrency(0));
        fx.worker.register("*", |_ctx| async { anyhow::Ok(json!(null)) }).unwrap();
        assert!(matches!(fx.worker.spawn(), Err(WorkerError::Config(_))));
    }
}
