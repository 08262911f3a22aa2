//! ThresholdEvaluator - Turns stored values into Nagios check results
//!
//! After a sample of a datasource with thresholds has been written, the
//! latest value is read back from the file, scaled by the datasource factor
//! and classified:
//!
//! ```text
//! critical range matches → CRITICAL
//! warning range matches  → WARNING
//! otherwise              → OK
//! malformed range        → UNKNOWN
//! ```
//!
//! Results are sent as passive check commands. Nothing is queued while the
//! sink is paused or disconnected: the next sample produces a fresh result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use super::range::is_out_of_bounds;
use crate::bus::{AlertSink, NagiosCommand};
use crate::confdb::{ConfigCache, DatasourceConfig};
use crate::error::{ConfigurationError, ConnectorError, ConnectorResult};
use crate::message::PerformanceMessage;
use crate::storage::StorageGateway;

const COMMAND_TYPE: &str = "nagios";
const COMMAND_NAME: &str = "PROCESS_SERVICE_CHECK_RESULT";

/// Nagios service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

impl ServiceState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            ServiceState::Ok => "OK",
            ServiceState::Warning => "WARNING",
            ServiceState::Critical => "CRITICAL",
            ServiceState::Unknown => "UNKNOWN",
        }
    }
}

/// Result of one threshold check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdAlert {
    pub host: String,
    pub check_name: String,
    pub state: ServiceState,
    pub message: String,
    pub routing_key: String,
    /// Unix seconds at evaluation time
    pub timestamp: f64,
}

impl ThresholdAlert {
    pub fn to_command(&self) -> NagiosCommand {
        NagiosCommand {
            message_type: COMMAND_TYPE.to_string(),
            routing_key: self.routing_key.clone(),
            timestamp: self.timestamp,
            host: self.host.clone(),
            cmdname: COMMAND_NAME.to_string(),
            value: format!(
                "{};{};{};{}",
                self.host,
                self.check_name,
                self.state.code(),
                self.message
            ),
        }
    }
}

/// Source of the current time, in Unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

impl<F> Clock for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Integral values are shown without a fractional part
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

/// Classify `value` (already scaled) against the ranges of `ds`
pub fn evaluate(value: f64, ds: &DatasourceConfig) -> (ServiceState, String) {
    let shown = format_value(value);
    let ranges = [
        (ServiceState::Critical, ds.critical_threshold.as_deref()),
        (ServiceState::Warning, ds.warning_threshold.as_deref()),
    ];

    for (state, range) in ranges {
        let Some(range) = range else { continue };
        match is_out_of_bounds(value, range) {
            Ok(true) => return (state, format!("{}: {shown}", state.label())),
            Ok(false) => {}
            Err(e) => {
                return (
                    ServiceState::Unknown,
                    format!("UNKNOWN: invalid {} threshold '{range}' ({e})", state.label().to_lowercase()),
                );
            }
        }
    }

    (ServiceState::Ok, format!("OK: {shown}"))
}

pub struct ThresholdEvaluator {
    confdb: Arc<ConfigCache>,
    gateway: Arc<StorageGateway>,
    sink: Option<Arc<dyn AlertSink>>,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
}

impl ThresholdEvaluator {
    pub fn new(
        confdb: Arc<ConfigCache>,
        gateway: Arc<StorageGateway>,
        sink: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self::with_clock(confdb, gateway, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        confdb: Arc<ConfigCache>,
        gateway: Arc<StorageGateway>,
        sink: Option<Arc<dyn AlertSink>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            confdb,
            gateway,
            sink,
            clock,
            paused: AtomicBool::new(false),
        }
    }

    /// Stop producing alerts until [`ThresholdEvaluator::resume`]
    pub fn pause(&self) {
        debug!("pausing threshold alerts");
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        debug!("resuming threshold alerts");
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Check the datasource of `msg` and send the result
    ///
    /// Returns the alert that was sent, if any.
    #[instrument(skip_all, fields(host = %msg.host, datasource = %msg.datasource))]
    pub async fn check_message(
        &self,
        msg: &PerformanceMessage,
    ) -> ConnectorResult<Option<ThresholdAlert>> {
        let Some(sink) = self.sink.as_ref().filter(|sink| sink.is_connected()) else {
            trace!("no connected alert sink, skipping check");
            return Ok(None);
        };
        if self.is_paused() {
            trace!("alerts paused, skipping check");
            return Ok(None);
        }

        let ds = self
            .confdb
            .get_datasource(&msg.host, &msg.datasource, true)
            .await?;

        let value = match self.gateway.get_last_value(&ds, msg).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                trace!("no usable value stored yet");
                return Ok(None);
            }
            Err(ConnectorError::Configuration(
                e @ ConfigurationError::MissingConfigurationData { .. },
            )) => {
                debug!("{e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let (state, message) = evaluate(value * ds.factor, &ds);
        let alert = ThresholdAlert {
            host: msg.host.clone(),
            check_name: ds.alert_name.clone().unwrap_or_default(),
            state,
            message,
            routing_key: ds.routing_key.clone().unwrap_or_default(),
            timestamp: self.clock.now(),
        };

        if let Err(e) = sink.send(alert.to_command()).await {
            warn!("could not send alert: {e:#}");
            return Ok(None);
        }

        debug!("sent {} for {}", state.label(), alert.check_name);
        Ok(Some(alert))
    }
}
