//! Job Server Library
//!
//! Background job framework: schedulers create jobs, workers claim and run
//! them, and a SQLite store records every job's lifecycle.

pub mod background_jobs;
pub mod cli_style;
pub mod config;
pub mod job_store;
pub mod metrics;
pub mod shutdown;
pub mod sqlite_persistence;

pub use background_jobs::{JobServer, JobServerError, JobServerSettings};
pub use job_store::{Job, JobStatus, JobStore, SqliteJobStore};
