//! Service container wiring stores, dead-letter handling, metrics and
//! listeners for one process.
//!
//! Built once at startup and cloned freely; every `Queue`, `Worker`,
//! `Maintenance` and `HealthService` handed out shares the same stores and
//! listener set.

use std::sync::Arc;

use sqlx::PgPool;

use lendq_core::{DomainResult, QueueName};
use lendq_events::{JobListener, ListenerSet};
use lendq_observability::{AlertThresholds, MetricsRegistry};

use crate::jobs::{
    DeadLetterManager, DeadLetterStore, DefaultJobOptions, HealthService, InMemoryDeadLetterStore, InMemoryJobStore,
    InstanceInfo, JobStore, Maintenance, MaintenanceConfig, PostgresDeadLetterStore, PostgresJobStore, Queue, Worker,
    WorkerConfig,
};

#[derive(Clone)]
pub struct JobSystem {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<DeadLetterManager>,
    metrics: Arc<MetricsRegistry>,
    listeners: Arc<ListenerSet>,
    defaults: DefaultJobOptions,
}

impl JobSystem {
    pub fn builder(store: Arc<dyn JobStore>, dead_letter_store: Arc<dyn DeadLetterStore>) -> JobSystemBuilder {
        JobSystemBuilder {
            store,
            dead_letter_store,
            instance: InstanceInfo::default(),
            defaults: DefaultJobOptions::default(),
            thresholds: AlertThresholds::default(),
            listeners: Vec::new(),
        }
    }

    /// Process-local stores; for tests and single-process tools.
    pub fn in_memory() -> Self {
        Self::builder(InMemoryJobStore::arc(), Arc::new(InMemoryDeadLetterStore::new())).build()
    }

    /// Both stores on one pool. Run [`crate::jobs::postgres::MIGRATOR`] first.
    pub fn postgres(pool: PgPool, instance: InstanceInfo) -> Self {
        Self::builder(
            Arc::new(PostgresJobStore::new(pool.clone())),
            Arc::new(PostgresDeadLetterStore::new(pool)),
        )
        .instance(instance)
        .build()
    }

    pub fn queue(&self, name: &str) -> DomainResult<Queue> {
        let name = QueueName::new(name)?;
        Ok(Queue::new(name, self.store.clone(), self.listeners.clone()).with_defaults(self.defaults.clone()))
    }

    pub fn worker(&self, queue: &str, config: WorkerConfig) -> DomainResult<Worker> {
        Ok(Worker::new(self.queue(queue)?, self.dead_letters.clone(), config))
    }

    pub fn maintenance(&self, queues: Vec<QueueName>, config: MaintenanceConfig) -> Maintenance {
        Maintenance::new(
            self.store.clone(),
            self.dead_letters.clone(),
            self.listeners.clone(),
            queues,
            config,
        )
    }

    pub fn health(&self, queues: Vec<QueueName>) -> HealthService {
        HealthService::new(self.store.clone(), self.dead_letters.clone(), self.metrics.clone(), queues)
    }

    /// Add a listener after construction. Events already emitted are not
    /// replayed.
    pub fn register_listener(&self, listener: Arc<dyn JobListener>) {
        self.listeners.register(listener);
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn listeners(&self) -> &Arc<ListenerSet> {
        &self.listeners
    }

    pub fn defaults(&self) -> &DefaultJobOptions {
        &self.defaults
    }
}

pub struct JobSystemBuilder {
    store: Arc<dyn JobStore>,
    dead_letter_store: Arc<dyn DeadLetterStore>,
    instance: InstanceInfo,
    defaults: DefaultJobOptions,
    thresholds: AlertThresholds,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl JobSystemBuilder {
    pub fn instance(mut self, instance: InstanceInfo) -> Self {
        self.instance = instance;
        self
    }

    /// Options applied to every queue handed out by the system.
    pub fn defaults(mut self, defaults: DefaultJobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Extra listener, registered after the metrics registry.
    pub fn listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> JobSystem {
        let metrics = Arc::new(MetricsRegistry::new(self.thresholds));
        let listeners = Arc::new(ListenerSet::new());
        listeners.register(metrics.clone());
        for listener in self.listeners {
            listeners.register(listener);
        }

        JobSystem {
            store: self.store,
            dead_letters: Arc::new(DeadLetterManager::new(self.dead_letter_store, self.instance)),
            metrics,
            listeners,
            defaults: self.defaults,
        }
    }
}
