//! Postgres-backed job and dead-letter stores.
//!
//! Every state transition is a single guarded `UPDATE ... RETURNING`, so
//! the row lock taken by the statement is the only coordination between
//! workers. Claims use `FOR UPDATE SKIP LOCKED`: concurrent pollers never
//! block on each other and never win the same row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Store error | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (integrity) | `23xxx` | `Corrupt` | Check/unique constraint violated by a write |
//! | Database (other) | Any other | `Unavailable` | Server-side failure, serialization, timeouts |
//! | Decode / ColumnDecode / ColumnNotFound | N/A | `Corrupt` | Row shape does not match the schema |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` | Connectivity |
//!
//! A unique violation during insert is not surfaced: it means another
//! producer won the dedupe race and the existing row is returned instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument, Span};

use lendq_core::{DeadLetterId, DedupeKey, JobId, QueueName};

use super::dead_letter::{DeadLetterCount, DeadLetterError, DeadLetterStore};
use super::retry::{BackoffKind, BackoffPolicy};
use super::store::{JobStore, JobStoreError, PurgeCounts, StalledRecovery};
use super::types::{DeadLetterRecord, Enqueued, Job, JobCounts, JobFailure, JobStatus, NewJob};

/// Schema for both stores; run at startup before any worker polls.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// How often an insert retries when the job holding its dedupe key
/// turns terminal between the insert and the follow-up read.
const DEDUPE_RACE_RETRIES: usize = 3;

const STALLED_ERROR: &str = "job stalled";

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_insert(&self, new: &NewJob) -> Result<Option<PgRow>, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, job_name, data, dedupe_key, priority,
                max_attempts, backoff_kind, backoff_delay_ms, status,
                attempts_made, progress, scheduled_for, correlation_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'waiting', 0, 0, $10, $11, $12)
            ON CONFLICT (queue_name, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND status <> 'failed'
                DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.id.as_uuid())
        .bind(new.queue.as_str())
        .bind(&new.name)
        .bind(&new.data)
        .bind(new.dedupe_key.as_ref().map(DedupeKey::as_str))
        .bind(new.priority)
        .bind(new.max_attempts as i32)
        .bind(new.backoff.kind.as_str())
        .bind(duration_to_ms(new.backoff.delay))
        .bind(new.scheduled_for)
        .bind(new.correlation_id.as_deref())
        .bind(new.created_at)
        .fetch_optional(&*self.pool)
        .await
    }

    async fn find_outstanding(&self, queue: &QueueName, key: &DedupeKey) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND dedupe_key = $2 AND status <> 'failed'
            LIMIT 1
            "#,
        )
        .bind(queue.as_str())
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_outstanding", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    /// A guarded update matched nothing: tell a missing row from one in the
    /// wrong state.
    async fn stale_or_missing(&self, id: JobId) -> JobStoreError {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await;
        match exists {
            Ok(Some(_)) => JobStoreError::StaleTransition(id),
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => map_sqlx_error("check_job_exists", e),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, new),
        fields(queue = %new.queue, job_name = %new.name, job_id = %new.id, duplicate),
        err
    )]
    async fn insert(&self, new: NewJob) -> Result<Enqueued, JobStoreError> {
        let span = Span::current();

        for _ in 0..DEDUPE_RACE_RETRIES {
            match self.try_insert(&new).await {
                Ok(Some(row)) => {
                    span.record("duplicate", false);
                    return Ok(Enqueued {
                        job: decode_job(&row)?,
                        duplicate: false,
                    });
                }
                Ok(None) => {}
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => return Err(map_sqlx_error("insert_job", e)),
            }

            let Some(key) = &new.dedupe_key else {
                return Err(JobStoreError::Corrupt(format!(
                    "insert of job {} returned no row",
                    new.id
                )));
            };
            if let Some(existing) = self.find_outstanding(&new.queue, key).await? {
                span.record("duplicate", true);
                return Ok(Enqueued {
                    job: existing,
                    duplicate: true,
                });
            }
            debug!(dedupe_key = %key, "conflicting job turned terminal, retrying insert");
        }

        Err(JobStoreError::unavailable(format!(
            "insert into queue '{}' kept racing on its dedupe key",
            new.queue
        )))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, queue), fields(queue = %queue, claimed), err)]
    async fn claim_batch(&self, queue: &QueueName, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'active',
                attempts_made = attempts_made + 1,
                processed_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue_name = $1
                    AND status = 'waiting'
                    AND scheduled_for <= NOW()
                    AND attempts_made < max_attempts
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING does not preserve the subquery order.
        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(Job::claim_order);

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, result), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId, attempts_made: u32, result: Value) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                result = $3,
                progress = 100
            WHERE id = $1 AND status = 'active' AND attempts_made = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts_made as i32)
        .bind(&result)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.stale_or_missing(id).await),
        }
    }

    #[instrument(skip(self, scheduled_for, failure), fields(job_id = %id, scheduled_for = %scheduled_for), err)]
    async fn reschedule_for_retry(
        &self,
        id: JobId,
        attempts_made: u32,
        scheduled_for: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting',
                scheduled_for = $3,
                error = $4,
                error_stack = $5
            WHERE id = $1 AND status = 'active' AND attempts_made = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts_made as i32)
        .bind(scheduled_for)
        .bind(&failure.message)
        .bind(failure.stack.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule_for_retry", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.stale_or_missing(id).await),
        }
    }

    #[instrument(skip(self, failure), fields(job_id = %id), err)]
    async fn mark_terminal_failed(
        &self,
        id: JobId,
        attempts_made: u32,
        failure: &JobFailure,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = NOW(),
                error = $3,
                error_stack = $4
            WHERE id = $1 AND status = 'active' AND attempts_made = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts_made as i32)
        .bind(&failure.message)
        .bind(failure.stack.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_terminal_failed", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.stale_or_missing(id).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_progress(&self, id: JobId, attempts_made: u32, percent: u8) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET progress = $3 WHERE id = $1 AND status = 'active' AND attempts_made = $2",
        )
        .bind(id.as_uuid())
        .bind(attempts_made as i32)
        .bind(i16::from(percent.min(100)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;

        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, queue), fields(queue = %queue), err)]
    async fn counts_by_status(&self, queue: &QueueName) -> Result<JobCounts, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting' AND scheduled_for <= NOW()) AS waiting,
                COUNT(*) FILTER (WHERE status = 'waiting' AND scheduled_for > NOW()) AS delayed,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            WHERE queue_name = $1
            "#,
        )
        .bind(queue.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts_by_status", e))?;

        let count = |column: &str| -> Result<u64, JobStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("counts_by_status", e))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };
        Ok(JobCounts {
            waiting: count("waiting")?,
            delayed: count("delayed")?,
            active: count("active")?,
            completed: count("completed")?,
            failed: count("failed")?,
        })
    }

    #[instrument(skip(self, queue, stalled_before), fields(queue = %queue, stalled_before = %stalled_before), err)]
    async fn recover_stalled(
        &self,
        queue: &QueueName,
        stalled_before: DateTime<Utc>,
    ) -> Result<StalledRecovery, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts_made >= max_attempts THEN 'failed' ELSE 'waiting' END,
                scheduled_for = CASE WHEN attempts_made >= max_attempts THEN scheduled_for ELSE NOW() END,
                completed_at = CASE WHEN attempts_made >= max_attempts THEN NOW() ELSE completed_at END,
                error = $3
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue_name = $1
                    AND status = 'active'
                    AND processed_at < $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue.as_str())
        .bind(stalled_before)
        .bind(STALLED_ERROR)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stalled", e))?;

        let mut recovery = StalledRecovery::default();
        for row in &rows {
            let job = decode_job(row)?;
            if job.status == JobStatus::Failed {
                recovery.failed.push(job);
            } else {
                recovery.requeued.push(job);
            }
        }
        Ok(recovery)
    }

    #[instrument(skip(self, queue, completed_before, failed_before), fields(queue = %queue), err)]
    async fn purge(
        &self,
        queue: &QueueName,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<PurgeCounts, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH deleted AS (
                DELETE FROM jobs
                WHERE queue_name = $1
                    AND (
                        (status = 'completed' AND COALESCE(completed_at, created_at) < $2)
                        OR (status = 'failed' AND COALESCE(completed_at, created_at) < $3)
                    )
                RETURNING status
            )
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM deleted
            "#,
        )
        .bind(queue.as_str())
        .bind(completed_before)
        .bind(failed_before)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge", e))?;

        let completed: i64 = row.try_get("completed").map_err(|e| map_sqlx_error("purge", e))?;
        let failed: i64 = row.try_get("failed").map_err(|e| map_sqlx_error("purge", e))?;
        Ok(PurgeCounts {
            completed: u64::try_from(completed).unwrap_or(0),
            failed: u64::try_from(failed).unwrap_or(0),
        })
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("ping", e))
    }
}

/// Postgres-backed [`DeadLetterStore`]. Append-only from this crate's side.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    #[instrument(
        skip(self, record),
        fields(dead_letter_id = %record.id, job_id = %record.original_job_id, queue = %record.original_queue),
        err
    )]
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_jobs (
                id, original_job_id, original_queue_name, original_job_name,
                original_data, failure_reason, failure_stack, attempts_made,
                max_attempts, original_created_at, processing_duration_ms,
                environment, server_instance, correlation_id, metadata,
                investigated, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.original_job_id.as_uuid())
        .bind(record.original_queue.as_str())
        .bind(&record.original_job_name)
        .bind(&record.original_data)
        .bind(&record.failure_reason)
        .bind(record.failure_stack.as_deref())
        .bind(record.attempts_made as i32)
        .bind(record.max_attempts as i32)
        .bind(record.original_created_at)
        .bind(i64::try_from(record.processing_duration_ms).unwrap_or(i64::MAX))
        .bind(&record.environment)
        .bind(&record.server_instance)
        .bind(record.correlation_id.as_deref())
        .bind(&record.metadata)
        .bind(record.investigated)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_dead_letter_error("insert_dead_letter", e))?;

        Ok(())
    }

    #[instrument(skip(self, queue), fields(queue = ?queue.map(QueueName::as_str)), err)]
    async fn list(&self, queue: Option<&QueueName>, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dead_letter_jobs
            WHERE ($1::text IS NULL OR original_queue_name = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(queue.map(QueueName::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_dead_letter_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map_err(|e| map_dead_letter_error("list_dead_letters", e))
                    .and_then(DeadLetterRecord::try_from)
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn counts_by_queue(&self) -> Result<BTreeMap<String, DeadLetterCount>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT
                original_queue_name,
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE NOT investigated) AS uninvestigated
            FROM dead_letter_jobs
            GROUP BY original_queue_name
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_dead_letter_error("dead_letter_counts", e))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let queue: String = row
                .try_get("original_queue_name")
                .map_err(|e| map_dead_letter_error("dead_letter_counts", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_dead_letter_error("dead_letter_counts", e))?;
            let uninvestigated: i64 = row
                .try_get("uninvestigated")
                .map_err(|e| map_dead_letter_error("dead_letter_counts", e))?;
            counts.insert(
                queue,
                DeadLetterCount {
                    total: u64::try_from(total).unwrap_or(0),
                    uninvestigated: u64::try_from(uninvestigated).unwrap_or(0),
                },
            );
        }
        Ok(counts)
    }
}

/// Coarse classification shared by both stores' error mappers.
enum SqlxFailure {
    Integrity(String),
    Decode(String),
    Unavailable(String),
}

fn classify_sqlx_error(operation: &str, err: sqlx::Error) -> SqlxFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                // Class 23: integrity constraint violation.
                Some(code) if code.starts_with("23") => SqlxFailure::Integrity(msg),
                _ => SqlxFailure::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => SqlxFailure::Decode(format!("unexpected row not found in {}", operation)),
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            SqlxFailure::Decode(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => SqlxFailure::Unavailable(format!("connection pool closed in {}", operation)),
        _ => SqlxFailure::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match classify_sqlx_error(operation, err) {
        SqlxFailure::Integrity(msg) | SqlxFailure::Decode(msg) => JobStoreError::Corrupt(msg),
        SqlxFailure::Unavailable(msg) => JobStoreError::Unavailable(msg),
    }
}

fn map_dead_letter_error(operation: &str, err: sqlx::Error) -> DeadLetterError {
    match classify_sqlx_error(operation, err) {
        SqlxFailure::Integrity(msg) | SqlxFailure::Decode(msg) => DeadLetterError::Corrupt(msg),
        SqlxFailure::Unavailable(msg) => DeadLetterError::Unavailable(msg),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn duration_to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let job_row = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(job_row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    job_name: String,
    data: Value,
    dedupe_key: Option<String>,
    priority: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_delay_ms: i64,
    status: String,
    attempts_made: i32,
    progress: i16,
    scheduled_for: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
    error_stack: Option<String>,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            job_name: row.try_get("job_name")?,
            data: row.try_get("data")?,
            dedupe_key: row.try_get("dedupe_key")?,
            priority: row.try_get("priority")?,
            max_attempts: row.try_get("max_attempts")?,
            backoff_kind: row.try_get("backoff_kind")?,
            backoff_delay_ms: row.try_get("backoff_delay_ms")?,
            status: row.try_get("status")?,
            attempts_made: row.try_get("attempts_made")?,
            progress: row.try_get("progress")?,
            scheduled_for: row.try_get("scheduled_for")?,
            processed_at: row.try_get("processed_at")?,
            completed_at: row.try_get("completed_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            error_stack: row.try_get("error_stack")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, detail: String| {
            JobStoreError::Corrupt(format!("job {}: invalid {}: {}", row.id, field, detail))
        };

        let queue = QueueName::new(row.queue_name.clone()).map_err(|e| corrupt("queue_name", e.to_string()))?;
        let dedupe_key = row
            .dedupe_key
            .clone()
            .map(DedupeKey::new)
            .transpose()
            .map_err(|e| corrupt("dedupe_key", e.to_string()))?;
        let status = JobStatus::parse(&row.status).ok_or_else(|| corrupt("status", row.status.clone()))?;
        let backoff_kind =
            BackoffKind::parse(&row.backoff_kind).ok_or_else(|| corrupt("backoff_kind", row.backoff_kind.clone()))?;
        let backoff_delay =
            u64::try_from(row.backoff_delay_ms).map_err(|_| corrupt("backoff_delay_ms", row.backoff_delay_ms.to_string()))?;
        let max_attempts =
            u32::try_from(row.max_attempts).map_err(|_| corrupt("max_attempts", row.max_attempts.to_string()))?;
        let attempts_made =
            u32::try_from(row.attempts_made).map_err(|_| corrupt("attempts_made", row.attempts_made.to_string()))?;
        let progress = u8::try_from(row.progress).map_err(|_| corrupt("progress", row.progress.to_string()))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue,
            name: row.job_name,
            data: row.data,
            dedupe_key,
            priority: row.priority,
            max_attempts,
            backoff: BackoffPolicy {
                kind: backoff_kind,
                delay: Duration::from_millis(backoff_delay),
            },
            status,
            attempts_made,
            progress: progress.min(100),
            scheduled_for: row.scheduled_for,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
            result: row.result,
            error: row.error,
            error_stack: row.error_stack,
            correlation_id: row.correlation_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: uuid::Uuid,
    original_job_id: uuid::Uuid,
    original_queue_name: String,
    original_job_name: String,
    original_data: Value,
    failure_reason: String,
    failure_stack: Option<String>,
    attempts_made: i32,
    max_attempts: i32,
    original_created_at: DateTime<Utc>,
    processing_duration_ms: i64,
    environment: String,
    server_instance: String,
    correlation_id: Option<String>,
    metadata: Value,
    investigated: bool,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            original_job_id: row.try_get("original_job_id")?,
            original_queue_name: row.try_get("original_queue_name")?,
            original_job_name: row.try_get("original_job_name")?,
            original_data: row.try_get("original_data")?,
            failure_reason: row.try_get("failure_reason")?,
            failure_stack: row.try_get("failure_stack")?,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            original_created_at: row.try_get("original_created_at")?,
            processing_duration_ms: row.try_get("processing_duration_ms")?,
            environment: row.try_get("environment")?,
            server_instance: row.try_get("server_instance")?,
            correlation_id: row.try_get("correlation_id")?,
            metadata: row.try_get("metadata")?,
            investigated: row.try_get("investigated")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = DeadLetterError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let original_queue = QueueName::new(row.original_queue_name.clone()).map_err(|e| {
            DeadLetterError::Corrupt(format!("dead letter {}: invalid queue name: {}", row.id, e))
        })?;

        Ok(DeadLetterRecord {
            id: DeadLetterId::from_uuid(row.id),
            original_job_id: JobId::from_uuid(row.original_job_id),
            original_queue,
            original_job_name: row.original_job_name,
            original_data: row.original_data,
            failure_reason: row.failure_reason,
            failure_stack: row.failure_stack,
            attempts_made: u32::try_from(row.attempts_made).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            original_created_at: row.original_created_at,
            processing_duration_ms: u64::try_from(row.processing_duration_ms).unwrap_or(0),
            environment: row.environment,
            server_instance: row.server_instance,
            correlation_id: row.correlation_id,
            metadata: row.metadata,
            investigated: row.investigated,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: uuid::Uuid::now_v7(),
            queue_name: "payments".into(),
            job_name: "pay-proposal".into(),
            data: json!({ "proposalId": "p-1" }),
            dedupe_key: Some("payment-p-1".into()),
            priority: 5,
            max_attempts: 3,
            backoff_kind: "fixed".into(),
            backoff_delay_ms: 1_500,
            status: "active".into(),
            attempts_made: 2,
            progress: 40,
            scheduled_for: now,
            processed_at: Some(now),
            completed_at: None,
            result: None,
            error: None,
            error_stack: None,
            correlation_id: Some("p-1".into()),
            created_at: now,
        }
    }

    #[test]
    fn job_row_decodes() {
        let job = Job::try_from(job_row()).unwrap();
        assert_eq!(job.queue.as_str(), "payments");
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.backoff, BackoffPolicy::fixed(Duration::from_millis(1_500)));
        assert_eq!(job.dedupe_key.as_ref().map(DedupeKey::as_str), Some("payment-p-1"));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let mut row = job_row();
        row.status = "paused".into();
        assert!(matches!(Job::try_from(row), Err(JobStoreError::Corrupt(_))));
    }

    #[test]
    fn negative_counters_are_corrupt() {
        let mut row = job_row();
        row.attempts_made = -1;
        assert!(matches!(Job::try_from(row), Err(JobStoreError::Corrupt(_))));
    }

    #[test]
    fn connectivity_errors_map_to_unavailable() {
        assert!(map_sqlx_error("ping", sqlx::Error::PoolClosed).is_unavailable());
        assert!(matches!(
            map_dead_letter_error("insert", sqlx::Error::PoolTimedOut),
            DeadLetterError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            JobStoreError::Corrupt(_)
        ));
    }
}
