//! Listener registration for job lifecycle events.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::bus::EventBus;
use crate::event::JobEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
}

impl ListenerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Receives job lifecycle events.
///
/// Called inline on the emitting task, so implementations should be quick
/// and must not block on I/O. Errors are logged by the [`ListenerSet`] and
/// otherwise ignored.
pub trait JobListener: Send + Sync {
    /// Name used in log lines when the listener fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`JobListener`].
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&JobEvent) -> Result<(), ListenerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> JobListener for FnListener<F>
where
    F: Fn(&JobEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError> {
        (self.f)(event)
    }
}

/// Forwards every event onto an [`EventBus`].
pub struct BusForwarder<B> {
    bus: B,
}

impl<B> BusForwarder<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> JobListener for BusForwarder<B>
where
    B: EventBus<JobEvent>,
{
    fn name(&self) -> &str {
        "bus-forwarder"
    }

    fn on_event(&self, event: &JobEvent) -> Result<(), ListenerError> {
        self.bus
            .publish(event.clone())
            .map_err(|e| ListenerError::failed(format!("{e:?}")))
    }
}

/// The registered listeners of one job system.
///
/// `emit` isolates each listener: an `Err` or a panic is logged at `warn`
/// and delivery continues with the next listener.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn JobListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn JobListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(_) => warn!(listener = listener.name(), "listener set poisoned; registration dropped"),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &JobEvent) {
        // Snapshot so a listener can register another without deadlocking.
        let listeners: Vec<Arc<dyn JobListener>> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(_) => {
                warn!(event = event.event_type(), "listener set poisoned; event dropped");
                return;
            }
        };

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    listener = listener.name(),
                    event = event.event_type(),
                    job_id = %event.job_id,
                    error = %err,
                    "job listener failed"
                ),
                Err(_) => warn!(
                    listener = listener.name(),
                    event = event.event_type(),
                    job_id = %event.job_id,
                    "job listener panicked"
                ),
            }
        }
    }
}

impl core::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryEventBus, JobEventKind};
    use lendq_core::{JobId, QueueName};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn waiting_event() -> JobEvent {
        JobEvent::new(
            JobId::new(),
            QueueName::new("payments").unwrap(),
            "pay-proposal",
            JobEventKind::Waiting,
        )
    }

    #[test]
    fn failing_and_panicking_listeners_do_not_stop_delivery() {
        let seen = Arc::new(AtomicUsize::new(0));
        let set = ListenerSet::new();

        set.register(Arc::new(FnListener::new("errors", |_: &JobEvent| {
            Err(ListenerError::failed("boom"))
        })));
        set.register(Arc::new(FnListener::new("panics", |_: &JobEvent| -> Result<(), ListenerError> {
            panic!("listener bug")
        })));
        let counter = seen.clone();
        set.register(Arc::new(FnListener::new("counts", move |_: &JobEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        set.emit(&waiting_event());
        set.emit(&waiting_event());

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn bus_forwarder_publishes_events() {
        let bus = Arc::new(InMemoryEventBus::<JobEvent>::new());
        let sub = bus.subscribe();
        let set = ListenerSet::new();
        set.register(Arc::new(BusForwarder::new(bus.clone())));

        let ev = waiting_event();
        set.emit(&ev);

        assert_eq!(sub.try_recv().unwrap(), ev);
    }
}
