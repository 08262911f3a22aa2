//! Error types for storage operations

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Marker rrdtool appends when two updates land in the same second.
/// The message does not depend on the locale.
const ILLEGAL_UPDATE_MARKER: &str = "(minimum one second step)";

/// Errors that can occur while running rrdtool jobs
#[derive(Debug, Error)]
pub enum StorageError {
    /// The worker answered with an `ERROR: ` line
    #[error("rrdtool could not process {}: {message}", filename.display())]
    Operation { filename: PathBuf, message: String },

    /// The worker failed to create a new RRD file
    #[error("rrdtool could not create {}: {message}", filename.display())]
    Creation { filename: PathBuf, message: String },

    /// The worker process went away while a job was in flight
    #[error("rrdtool process exited while working on {}", filename.display())]
    ProcessExited { filename: PathBuf },

    /// Writing to or reading from the worker pipes failed
    #[error("rrdtool pipe error: {0}")]
    Transport(#[source] std::io::Error),

    /// I/O error on the RRD tree (rename, permissions, directories)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl StorageError {
    /// Two updates for the same file arrived within one second
    pub fn is_illegal_update(&self) -> bool {
        matches!(self, StorageError::Operation { message, .. } if message.ends_with(ILLEGAL_UPDATE_MARKER))
    }

    /// Turn an operation failure into a creation failure
    pub(crate) fn into_creation(self) -> Self {
        match self {
            StorageError::Operation { filename, message } => {
                StorageError::Creation { filename, message }
            }
            other => other,
        }
    }
}

/// Errors of the worker pool itself
#[derive(Debug, Error)]
pub enum PoolError {
    /// The semaphore let a job through but every worker was busy.
    /// This is a bug, never a retry condition.
    #[error("no rrdtool process available although the semaphore granted access")]
    NoAvailableProcess,

    #[error("unable to start \"{}\": make sure the path is correct", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("unable to start \"{}\": make sure rrdtool is installed and you have permissions to use it", .0.display())]
    BinaryNotExecutable(PathBuf),

    #[error("the RRD directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("unable to create directory '{}': {source}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to write in the directory '{}'", .0.display())]
    DirectoryNotWritable(PathBuf),

    #[error("failed to spawn \"{}\": {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pool was stopped and accepts no more jobs
    #[error("the rrdtool pool has been stopped")]
    Stopped,
}

impl PoolError {
    /// Errors that prevent the pool from starting at all
    pub fn is_startup(&self) -> bool {
        !matches!(self, PoolError::NoAvailableProcess | PoolError::Stopped)
    }
}
