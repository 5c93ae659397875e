//! `lendq-worker`: process wiring for the job core (environment
//! configuration, database pool and the maintenance/health loops).

pub mod config;

pub use config::{ConfigError, WorkerProcessConfig};
