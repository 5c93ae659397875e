//! Processor registration and the per-job execution context.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use lendq_core::{DomainError, DomainResult, JobId, JobPayload};

use super::queue::Queue;
use super::types::Job;

/// What a processor sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    queue: Queue,
}

impl JobContext {
    pub fn new(job: Job, queue: Queue) -> Self {
        Self { job, queue }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn data(&self) -> &Value {
        &self.job.data
    }

    /// 1-based number of the running attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Report progress (clamped to 0..=100). Failures are logged, never
    /// returned: progress is advisory.
    pub async fn update_progress(&self, percent: u8) {
        if let Err(err) = self.queue.update_progress(&self.job, percent).await {
            warn!(
                queue = %self.job.queue,
                job_id = %self.job.id,
                percent,
                error = %err,
                "failed to record job progress"
            );
        }
    }
}

/// Performs the work for one job kind.
///
/// Returning `Err` (or panicking) counts as a failed attempt. The returned
/// value is stored as the job result.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`Processor`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProcessor<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.f)(ctx).await
    }
}

/// Decodes `P` from the job data before calling the closure. A payload that
/// does not decode is a failed attempt.
pub struct TypedProcessor<P, F, Fut> {
    f: F,
    _marker: PhantomData<fn(P) -> Fut>,
}

impl<P, F, Fut> TypedProcessor<P, F, Fut>
where
    P: JobPayload,
    F: Fn(P, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, _marker: PhantomData }
    }
}

#[async_trait]
impl<P, F, Fut> Processor for TypedProcessor<P, F, Fut>
where
    P: JobPayload,
    F: Fn(P, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let payload: P = serde_json::from_value(ctx.data().clone())
            .with_context(|| format!("invalid payload for job '{}'", P::JOB_NAME))?;
        (self.f)(payload, ctx).await
    }
}

/// Processors by job name.
///
/// Lookup order: exact name, then the longest matching `prefix.*`
/// pattern, then `*`.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each name may be registered once.
    pub fn register(&mut self, job_name: impl Into<String>, processor: Arc<dyn Processor>) -> DomainResult<()> {
        let job_name = job_name.into();
        if job_name.is_empty() {
            return Err(DomainError::validation("processor name must not be empty"));
        }
        if self.processors.contains_key(&job_name) {
            return Err(DomainError::conflict(format!(
                "a processor is already registered for '{job_name}'"
            )));
        }
        self.processors.insert(job_name, processor);
        Ok(())
    }

    pub fn resolve(&self, job_name: &str) -> Option<Arc<dyn Processor>> {
        if let Some(p) = self.processors.get(job_name) {
            return Some(p.clone());
        }

        self.processors
            .iter()
            .filter_map(|(pattern, p)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_name
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), p))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, p)| p.clone())
            .or_else(|| self.processors.get("*").cloned())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry").field("names", &self.names()).finish()
    }
}
