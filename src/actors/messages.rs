//! Commands understood by the connector actor

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ConnectorResult;
use crate::pipeline::{ConnectorStats, ProcessOutcome};
use crate::storage::PoolError;

/// Commands that can be sent to the ConnectorActor
#[derive(Debug)]
pub enum ConnectorCommand {
    /// Start the rrdtool pools and reset the illegal update counter
    Start {
        respond_to: oneshot::Sender<Result<(), PoolError>>,
    },

    /// Run one bus message through the pipeline
    Process {
        message: Value,
        respond_to: oneshot::Sender<ConnectorResult<ProcessOutcome>>,
    },

    /// Get the pipeline counters
    GetStats {
        respond_to: oneshot::Sender<ConnectorStats>,
    },

    /// Whether the rrdtool pools are started
    IsConnected { respond_to: oneshot::Sender<bool> },

    /// Reload the configuration database if it changed
    Reload { respond_to: oneshot::Sender<bool> },

    /// Stop producing threshold alerts
    PauseAlerts,

    /// Produce threshold alerts again
    ResumeAlerts,

    /// Stop the pools and the actor
    Shutdown { respond_to: oneshot::Sender<()> },
}
