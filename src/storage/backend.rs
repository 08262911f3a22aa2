//! Job runner trait definition
//!
//! The storage gateway does not talk to processes itself. It hands [`Job`]s
//! to a `JobRunner`, which is the [`PoolManager`](super::pool::PoolManager)
//! in production and a recording fake in tests.

use async_trait::async_trait;

use super::error::StorageResult;
use super::worker::Job;

/// Something that can execute rrdtool jobs
///
/// ## Routing
///
/// `bypass_cache` asks for a worker that reads and writes the files directly
/// instead of going through rrdcached. Runners without a cache ignore it.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared between the
/// gateway and the threshold evaluator.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one job and return the output lines preceding the `OK` status
    async fn run(&self, job: Job, bypass_cache: bool) -> StorageResult<String>;
}
