//! Request Serving
//!
//! The worker pool that executes directory requests.

mod pool;

pub use pool::WorkerPool;
