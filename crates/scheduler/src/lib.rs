//! Materialization scheduling: job lifecycle, retry policy, batch engines,
//! the scheduler context, worker pool and dispatcher tick loop.

pub mod batch;
pub mod dispatcher;
pub mod job;
pub mod local;
pub mod retry;
pub mod scheduler;
pub mod spark;
pub mod worker;

pub use batch::{BatchEngine, BatchFailure, BatchRequest, FailureKind, TaskHandle, TaskStatus};
pub use dispatcher::Dispatcher;
pub use job::{JobState, MaterializationJob};
pub use local::LocalBatchEngine;
pub use retry::RetryPolicy;
pub use scheduler::{JobScheduler, TickOutcome};
pub use spark::SparkSubmitEngine;
pub use worker::WorkerPool;
