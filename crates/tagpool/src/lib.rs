//! tagpool: tagged, elastic worker pool.
//!
//! Execution slots are partitioned into named groups with reserved capacity;
//! a generic overflow group lends slots to any saturated tag. Group sizes
//! can be adjusted while work is in flight, submission backpressures on
//! capacity, and results reach callbacks or a lazy iteration surface.

mod error;
mod executor;
mod ledger;
mod pool;
mod pump;
mod tag;
mod task;

pub use error::{PoolError, TaskError};
pub use executor::{Completion, Executor, Job, SpawnBlockingExecutor};
pub use ledger::ResizeReport;
pub use pool::{IngestHandle, Pool, PoolBuilder};
pub use tag::Tag;
pub use task::{DataCallback, ErrorCallback, TaskHandle, TaskId, TaskOptions};
