//! RRD storage through rrdtool processes
//!
//! ## Layers
//!
//! - **worker**: one actor per rrdtool process, speaking the pipe protocol
//! - **pool**: fixed-size pools of workers behind a semaphore
//! - **backend**: the `JobRunner` seam between pools and their users
//! - **gateway**: create-if-needed, update and fetch of RRD files
//! - **path**: where the file of a (host, datasource) pair lives

pub mod backend;
pub mod error;
pub mod gateway;
pub mod path;
pub mod pool;
pub mod worker;

pub use backend::JobRunner;
pub use error::{PoolError, StorageError, StorageResult};
pub use gateway::{StorageGateway, parse_last_value};
pub use path::{PathMode, PathResolver};
pub use pool::{PoolManager, PoolOptions, ProcessPool};
pub use worker::Job;
