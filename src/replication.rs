//! Replication of finished archives to the external long-term store.
//!
//! Components:
//! - `client`: the S3-like API client, with error classification.
//! - `budgets`: independent retry budgets per failure class.
//! - `queues`: in-process write and read-only task queues.
//! - `state_machine`: per-file upload/delete lifecycle.
//! - `confirm`: eventual-consistency confirmation of uploads and deletes.
//! - `scheduler`: daily batching under global and per-day caps.
//! - `worker`: the task loop draining the queues.

pub mod budgets;
pub mod client;
pub mod confirm;
pub mod queues;
pub mod scheduler;
pub mod state_machine;
pub mod worker;

pub use budgets::{RetryBudgets, RetryCounters};
pub use client::ArchiveSession;
pub use queues::{ReplicationQueues, ReplicationTask};
pub use scheduler::DailyBatchScheduler;
pub use state_machine::ReplicationEngine;
