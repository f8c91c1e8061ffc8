//! Background processing: retry policy, worker pool, dispatcher and the
//! submission facade

mod dispatcher;
mod job_queue;
mod retry;
mod worker;

pub use dispatcher::{Dispatcher, Health};
pub use job_queue::JobQueue;
pub use retry::{decide, RetryDecision, RetryPolicy};
pub use worker::{Slot, WorkerPool};
