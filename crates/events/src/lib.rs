//! Job lifecycle events and their delivery.
//!
//! The queue and worker emit a [`JobEvent`] for every state change. Events
//! are delivered synchronously to registered [`JobListener`]s through a
//! [`ListenerSet`]; a listener that errors or panics is logged and skipped,
//! never allowed to affect job processing. Consumers that prefer a channel
//! can attach a [`BusForwarder`] and read from an [`EventBus`] subscription.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod listener;

pub use bus::{EventBus, Subscription};
pub use event::{JobEvent, JobEventKind};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use listener::{BusForwarder, FnListener, JobListener, ListenerError, ListenerSet};
