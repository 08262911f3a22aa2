//! Bus to RRD connector
//!
//! Consumes performance messages, stores them in round-robin databases
//! through a pool of `rrdtool -` processes and raises Nagios passive check
//! results when a datasource crosses its thresholds.

pub mod actors;
pub mod bus;
pub mod confdb;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod storage;
pub mod threshold;

pub use error::{ConnectorError, ConnectorResult};
pub use message::{MetricValue, PerformanceMessage};
pub use pipeline::{ConnectorStats, MessagePipeline, ProcessOutcome};
