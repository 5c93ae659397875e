//! Infrastructure layer: job stores, queue, worker, dead-letter handling,
//! maintenance and health reporting.

pub mod context;
pub mod jobs;

mod integration_tests;

pub use context::{JobSystem, JobSystemBuilder};
pub use jobs::postgres::MIGRATOR;
