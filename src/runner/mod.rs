//! Bounded-concurrency task execution

pub mod classify;
pub mod limiter;
pub mod worker_pool;

pub use classify::is_transient_message;
pub use limiter::ConcurrencyLimiter;
pub use worker_pool::{AbortFlag, ItemOutcome, RunOptions, WorkerContext, WorkerPool};
