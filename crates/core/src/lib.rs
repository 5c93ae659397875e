//! `lendq-core`: job-queue building blocks with no infrastructure concerns.
//!
//! Identifiers, the domain error model, validated value objects and the
//! typed payload contract shared by producers and processors.

pub mod error;
pub mod id;
pub mod payload;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, JobId};
pub use payload::JobPayload;
pub use value_object::{DedupeKey, QueueName, ValueObject};
