//! MessagePipeline - From a bus message to an RRD update
//!
//! ```text
//! parse → known host? → create if needed → update → check thresholds
//! ```
//!
//! Each stage returns a typed error. [`MessagePipeline::process`] logs it at
//! the level its class deserves and hands it back; the caller decides whether
//! to go on (it always does, unless the error is fatal).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, instrument, trace, warn};

use crate::confdb::ConfigCache;
use crate::error::{ConfigurationError, ConnectorError, ConnectorResult, ValidationError};
use crate::message::PerformanceMessage;
use crate::storage::{StorageError, StorageGateway};
use crate::threshold::{ThresholdAlert, ThresholdEvaluator};

/// Counters exposed by the stats query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    pub received: u64,
    pub forwarded: u64,
    pub illegal_updates: u64,
    /// Datasources known to the configuration
    pub pds_count: i64,
}

/// What happened to a stored message
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub filename: PathBuf,
    pub alert: Option<ThresholdAlert>,
}

pub struct MessagePipeline {
    confdb: Arc<ConfigCache>,
    gateway: Arc<StorageGateway>,
    evaluator: Option<Arc<ThresholdEvaluator>>,
    received: AtomicU64,
    forwarded: AtomicU64,
    illegal_updates: AtomicU64,
}

impl MessagePipeline {
    pub fn new(
        confdb: Arc<ConfigCache>,
        gateway: Arc<StorageGateway>,
        evaluator: Option<Arc<ThresholdEvaluator>>,
    ) -> Self {
        Self {
            confdb,
            gateway,
            evaluator,
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            illegal_updates: AtomicU64::new(0),
        }
    }

    pub fn confdb(&self) -> &Arc<ConfigCache> {
        &self.confdb
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }

    pub fn evaluator(&self) -> Option<&Arc<ThresholdEvaluator>> {
        self.evaluator.as_ref()
    }

    /// Process one raw bus message
    pub async fn process(&self, raw: &Value) -> ConnectorResult<ProcessOutcome> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let result = self.run_stages(raw).await;
        if let Err(e) = &result {
            report(e);
        }
        result
    }

    #[instrument(skip_all)]
    async fn run_stages(&self, raw: &Value) -> ConnectorResult<ProcessOutcome> {
        let msg = PerformanceMessage::parse(raw).inspect_err(|e| {
            // Not meant for this connector at all
            if matches!(e, ValidationError::WrongMessageType(_)) {
                self.received.fetch_sub(1, Ordering::Relaxed);
            }
        })?;

        if !self.confdb.has_host(&msg.host).await? {
            self.received.fetch_sub(1, Ordering::Relaxed);
            return Err(ConfigurationError::NotInConfiguration {
                host: msg.host,
                datasource: msg.datasource,
            }
            .into());
        }

        let filename = self.gateway.create_if_needed(&msg).await?;

        let has_thresholds = match &self.evaluator {
            Some(_) => self.confdb.has_threshold(&msg.host, &msg.datasource).await?,
            None => false,
        };

        if let Err(e) = self.gateway.update(&msg, has_thresholds).await {
            if e.is_illegal_update() {
                self.illegal_updates.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e.into());
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let alert = match (&self.evaluator, has_thresholds) {
            (Some(evaluator), true) => evaluator.check_message(&msg).await?,
            _ => None,
        };

        Ok(ProcessOutcome { filename, alert })
    }

    pub async fn stats(&self) -> ConnectorStats {
        let pds_count = self.confdb.count_datasources().await.unwrap_or_else(|e| {
            warn!("could not count datasources: {e}");
            0
        });

        ConnectorStats {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            illegal_updates: self.illegal_updates.load(Ordering::Relaxed),
            pds_count,
        }
    }

    /// Start counting illegal updates from zero again
    pub fn reset_illegal_updates(&self) {
        self.illegal_updates.store(0, Ordering::Relaxed);
    }
}

/// Log an error at the level of its class
fn report(err: &ConnectorError) {
    match err {
        ConnectorError::Validation(e) => error!("{e}"),
        ConnectorError::Configuration(e) => debug!("{e}"),
        ConnectorError::Storage(e) if e.is_illegal_update() => trace!("{e}"),
        ConnectorError::Storage(StorageError::Pool(e)) if err.is_fatal() => {
            error!("{e}: this is a bug, the connector cannot go on")
        }
        ConnectorError::Storage(e) => error!("{e}"),
        ConnectorError::Database(e) => error!("configuration database error: {e}"),
        ConnectorError::Unavailable => warn!("{err}"),
    }
}
