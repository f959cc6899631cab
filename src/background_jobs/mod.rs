//! Background job scheduling and execution.
//!
//! Each job type registers a [`JobScheduler`] that decides when to create a
//! job and a [`JobWorker`] that executes it. The [`JobServer`] runs every
//! scheduler and worker as its own task; they meet only through the
//! [`JobStore`](crate::job_store::JobStore), whose atomic claim guarantees
//! that a job is executed by at most one worker.

mod context;
mod isolation;
mod job;
pub mod jobs;
mod scheduler;
mod server;
mod worker;

pub use context::JobContext;
pub use isolation::{handle_job_panic, panic_message, PanicPayload};
pub use job::{JobError, JobScheduler, JobWorker, PeriodicScheduler, ShutdownBehavior, SimpleWorker};
pub use scheduler::TickOutcome;
pub use server::{JobServer, JobServerError, JobServerSettings, JobTypeInfo};
pub use worker::AttemptOutcome;
