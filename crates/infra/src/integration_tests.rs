//! Integration tests for the full job pipeline.
//!
//! Tests: Queue → JobStore → Worker → (Retry | DeadLetter) → Metrics/Health
//!
//! Verifies:
//! - Dedupe holds under concurrent producers
//! - Concurrent workers never process a job twice
//! - Metrics, alerts and health reflect what the workers did
//! - Typed payloads travel end to end
//! - Stalled claims are recovered by maintenance

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    use lendq_core::{DomainError, DomainResult, JobId, JobPayload};

    use crate::context::JobSystem;
    use crate::jobs::{
        BackoffPolicy, InMemoryDeadLetterStore, InMemoryJobStore, JobContext, JobOptions, JobStatus, JobStore,
        MaintenanceConfig, WorkerConfig,
    };

    fn setup() -> (JobSystem, Arc<InMemoryJobStore>, Arc<InMemoryDeadLetterStore>) {
        let store = InMemoryJobStore::arc();
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let system = JobSystem::builder(store.clone(), dead_letters.clone()).build();
        (system, store, dead_letters)
    }

    fn single_attempt() -> JobOptions {
        JobOptions::new()
            .with_attempts(1)
            .with_backoff(BackoffPolicy::fixed(Duration::ZERO))
    }

    async fn wait_for_completed(system: &JobSystem, queue: &str, expected: u64) {
        let queue = system.queue(queue).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if queue.counts().await.unwrap().completed >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not complete in time");
    }

    async fn refuse(_ctx: JobContext) -> anyhow::Result<Value> {
        anyhow::bail!("smtp refused")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueue_with_same_key_creates_one_job() {
        let (system, store, _) = setup();
        let queue = system.queue("payments").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .add(
                        "pay-proposal",
                        json!({ "proposalId": "p-42" }),
                        JobOptions::new().with_dedupe_key("payment-p-42"),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let first = results[0].job.id;
        assert!(results.iter().all(|r| r.job.id == first));
        assert_eq!(results.iter().filter(|r| !r.duplicate).count(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn same_millisecond_payment_requests_collapse() {
        let (system, _, _) = setup();
        let queue = system.queue("payments").unwrap();
        let options = || JobOptions::new().with_dedupe_key("payment-p-7");

        let (a, b) = tokio::join!(
            queue.add("pay-proposal", json!({ "amount": 100 }), options()),
            queue.add("pay-proposal", json!({ "amount": 100 }), options()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.job.id, b.job.id);
        assert!(a.duplicate ^ b.duplicate);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_double_process() {
        let (system, _, dead_letters) = setup();
        let queue = system.queue("reports").unwrap();
        for i in 0..60 {
            queue.add("render", json!({ "n": i }), JobOptions::new()).await.unwrap();
        }

        let seen: Arc<Mutex<HashMap<JobId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut handles = Vec::new();
        for w in 0..4 {
            let config = WorkerConfig::default()
                .with_name(format!("worker-{w}"))
                .with_concurrency(4)
                .with_poll_interval(Duration::from_millis(5));
            let mut worker = system.worker("reports", config).unwrap();
            let seen = seen.clone();
            worker
                .register("render", move |ctx: JobContext| {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap().entry(ctx.id()).or_default() += 1;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        anyhow::Ok(json!({ "ok": true }))
                    }
                })
                .unwrap();
            handles.push(worker.spawn().unwrap());
        }

        wait_for_completed(&system, "reports", 60).await;
        for handle in handles {
            handle.shutdown().await.unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 60);
        assert!(seen.values().all(|&n| n == 1));
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn failure_rate_alert_from_worker_activity() {
        let (system, _, dead_letters) = setup();
        let mut worker = system
            .worker("reports", WorkerConfig::default().with_concurrency(16))
            .unwrap();
        worker
            .register("render", |ctx: JobContext| async move {
                if ctx.data()["fail"] == json!(true) {
                    anyhow::bail!("template missing");
                }
                anyhow::Ok(Value::Null)
            })
            .unwrap();

        let queue = worker.queue().clone();
        for _ in 0..10 {
            queue.add("render", json!({}), single_attempt()).await.unwrap();
        }
        queue.add("render", json!({ "fail": true }), single_attempt()).await.unwrap();
        assert_eq!(worker.poll_once().await.unwrap(), 11);

        let snapshot = system.metrics().snapshot("reports").unwrap();
        assert_eq!((snapshot.total, snapshot.completed, snapshot.failed), (11, 10, 1));
        assert_eq!(snapshot.active, 0);
        assert!((snapshot.failure_rate - 9.0909).abs() < 0.01);
        assert!(snapshot.alerts.high_failure_rate);
        assert!(!snapshot.alerts.dead_letter_backlog);
        assert_eq!(snapshot.dead_letter_size, 1);
        assert_eq!(dead_letters.len(), 1);

        let report = system.health(vec![queue.name().clone()]).report().await;
        assert!(report.healthy);
        assert_eq!(report.alerting_queues(), vec!["reports"]);
        assert_eq!(report.dead_letter.total(), 1);
    }

    #[tokio::test]
    async fn dead_letter_outage_degrades_health_only() {
        let (system, _, dead_letters) = setup();
        dead_letters.set_unavailable(true);

        let mut worker = system.worker("emails", WorkerConfig::default()).unwrap();
        worker
            .register("send", refuse)
            .unwrap();
        let queue = worker.queue().clone();
        let failed = queue.add("send", json!({}), single_attempt()).await.unwrap().job.id;
        worker.poll_once().await.unwrap();

        let job = queue.get(failed).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(worker.stats().dead_lettered, 1);

        let report = system.health(vec![queue.name().clone()]).report().await;
        assert!(!report.healthy);
        assert!(!report.dead_letter.healthy);
        assert_eq!(report.queues["emails"].counts.unwrap().failed, 1);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct GenerateCcb {
        proposal_id: String,
        pages: u32,
    }

    impl JobPayload for GenerateCcb {
        const QUEUE: &'static str = "pdf-processing";
        const JOB_NAME: &'static str = "generate-ccb";

        fn validate(&self) -> DomainResult<()> {
            if self.pages == 0 {
                return Err(DomainError::validation("pages must be positive"));
            }
            Ok(())
        }

        fn dedupe_key(&self) -> Option<String> {
            Some(format!("ccb-{}", self.proposal_id))
        }

        fn correlation_id(&self) -> Option<String> {
            Some(self.proposal_id.clone())
        }
    }

    #[tokio::test]
    async fn typed_payload_round_trip() {
        let (system, _, _) = setup();
        let mut worker = system.worker("pdf-processing", WorkerConfig::default()).unwrap();
        worker
            .register_typed::<GenerateCcb, _, _>(|payload, ctx| async move {
                ctx.update_progress(50).await;
                anyhow::Ok(json!({ "proposal": payload.proposal_id, "pages": payload.pages }))
            })
            .unwrap();

        let queue = worker.queue().clone();
        let payload = GenerateCcb {
            proposal_id: "p-9".into(),
            pages: 3,
        };
        let first = queue.add_typed(&payload, JobOptions::new()).await.unwrap();
        let again = queue.add_typed(&payload, JobOptions::new()).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(first.job.correlation_id.as_deref(), Some("p-9"));

        let invalid = GenerateCcb {
            proposal_id: "p-10".into(),
            pages: 0,
        };
        assert!(queue.add_typed(&invalid, JobOptions::new()).await.unwrap_err().is_validation());

        worker.poll_once().await.unwrap();
        let job = queue.get(first.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({ "proposal": "p-9", "pages": 3 })));
    }

    #[tokio::test]
    async fn stalled_claim_is_recovered_and_completed() {
        let (system, store, _) = setup();
        let queue = system.queue("reports").unwrap();
        let id = queue.add("render", json!({}), JobOptions::new()).await.unwrap().job.id;

        // A worker claimed the job and died before reporting.
        let claimed = store.claim_batch(queue.name(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let maintenance = system.maintenance(
            vec![queue.name().clone()],
            MaintenanceConfig::default().with_stalled_timeout(Duration::ZERO),
        );
        assert_eq!(maintenance.run_once().await.requeued, 1);

        let mut worker = system.worker("reports", WorkerConfig::default()).unwrap();
        worker
            .register("render", |_ctx: JobContext| async move { anyhow::Ok(Value::Null) })
            .unwrap();
        assert_eq!(worker.poll_once().await.unwrap(), 1);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts_made, 2);
    }
}
