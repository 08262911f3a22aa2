//! Error taxonomy of the connector
//!
//! Per-message errors (validation, configuration, storage) are recovered by
//! the pipeline: the message is dropped and the next one is processed. Only a
//! violated pool invariant is fatal.

use thiserror::Error;

use crate::storage::error::{PoolError, StorageError};

/// Result type alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// The producer sent something that is not a usable performance message
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("'{0}' is not a valid message type for metrology")]
    WrongMessageType(String),

    #[error("not a valid performance message (missing '{0}' field)")]
    MissingField(&'static str),

    #[error("invalid metrology value: {0}")]
    InvalidValue(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// The configuration store does not know about the message's subject
///
/// Expected during provisioning lag, so these are only logged at debug level.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("host {host} with datasource {datasource} is not in the configuration")]
    NotInConfiguration { host: String, datasource: String },

    #[error("datasource {datasource} on host {host} has no {field} configured")]
    MissingConfigurationData {
        host: String,
        datasource: String,
        field: &'static str,
    },
}

/// Any error the message pipeline can run into
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The configuration database could not be queried
    #[error("configuration database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The connector actor is gone
    #[error("connector is not running")]
    Unavailable,
}

impl ConnectorError {
    /// Whether the error means the connector itself is broken
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectorError::Storage(StorageError::Pool(PoolError::NoAvailableProcess))
        )
    }
}

impl From<PoolError> for ConnectorError {
    fn from(err: PoolError) -> Self {
        ConnectorError::Storage(StorageError::Pool(err))
    }
}
