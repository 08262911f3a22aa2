//! StorageGateway - RRD files as seen by the message pipeline
//!
//! ## Creation
//!
//! A file is created the first time a sample arrives for it:
//!
//! ```text
//! create <file> --step 300 --start <timestamp - 10> RRA:... DS:DS:GAUGE:600:U:U
//! ```
//!
//! The start is set ten seconds before the first sample so that the update
//! following the creation is never rejected as too early. Files left at their
//! legacy location are moved instead of being created again.
//!
//! Concurrent messages for a new file wait on a per-file lock, so only one of
//! them issues the `create`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::backend::JobRunner;
use super::error::{StorageError, StorageResult};
use super::path::PathResolver;
use super::worker::Job;
use crate::confdb::{ConfigCache, DatasourceConfig, RetentionArchive};
use crate::error::{ConfigurationError, ConnectorResult};
use crate::message::PerformanceMessage;

/// Seconds between the start of a new file and its first sample
const CREATE_START_OFFSET: i64 = 10;

/// Permissions of a new RRD file
const RRD_FILE_MODE: u32 = 0o640;

pub struct StorageGateway {
    runner: Arc<dyn JobRunner>,
    confdb: Arc<ConfigCache>,
    paths: PathResolver,
    creating: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl StorageGateway {
    pub fn new(runner: Arc<dyn JobRunner>, confdb: Arc<ConfigCache>, paths: PathResolver) -> Self {
        Self {
            runner,
            confdb,
            paths,
            creating: DashMap::new(),
        }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// File storing the samples of `msg`
    pub fn filename(&self, msg: &PerformanceMessage) -> PathBuf {
        self.paths.path_for(&msg.host, &msg.datasource)
    }

    /// Make sure the file for `msg` exists and return its path
    #[instrument(skip_all, fields(host = %msg.host, datasource = %msg.datasource))]
    pub async fn create_if_needed(&self, msg: &PerformanceMessage) -> ConnectorResult<PathBuf> {
        let filename = self.filename(msg);
        if exists(&filename).await {
            return Ok(filename);
        }

        let lock = Arc::clone(self.creating.entry(filename.clone()).or_default().value());
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(msg, &filename).await
        };
        drop(lock);
        self.creating
            .remove_if(&filename, |_, lock| Arc::strong_count(lock) == 1);

        result.map(|()| filename)
    }

    async fn create_locked(&self, msg: &PerformanceMessage, filename: &Path) -> ConnectorResult<()> {
        // Another message may have created it while we waited
        if exists(filename).await {
            return Ok(());
        }

        let legacy = self.paths.legacy_path(&msg.host, &msg.datasource);
        if legacy != filename && exists(&legacy).await {
            create_parent(filename).await?;
            tokio::fs::rename(&legacy, filename)
                .await
                .map_err(StorageError::Io)?;
            info!(
                "moved {} to {}",
                legacy.display(),
                filename.display()
            );
            return Ok(());
        }

        let ds = self
            .confdb
            .get_datasource(&msg.host, &msg.datasource, false)
            .await?;
        let archives = self.confdb.get_retention_archives(ds.id).await?;

        create_parent(filename).await?;

        let job = Job::new("create", filename, create_arguments(&ds, &archives, msg.timestamp));
        self.runner
            .run(job, false)
            .await
            .map_err(StorageError::into_creation)?;
        debug!("created {}", filename.display());

        if let Err(e) = set_mode(filename, RRD_FILE_MODE).await {
            warn!("could not set permissions of {}: {e}", filename.display());
        }

        Ok(())
    }

    /// Store the sample of `msg`
    ///
    /// Datasources with thresholds are written through the direct pool so the
    /// following check reads the value just written.
    pub async fn update(&self, msg: &PerformanceMessage, has_thresholds: bool) -> StorageResult<()> {
        let job = Job::new("update", self.filename(msg), vec![msg.update_argument()]);
        self.runner.run(job, has_thresholds).await.map(|_| ())
    }

    /// Latest value stored for `ds`, read from the files directly
    ///
    /// Only datasources with a complete alerting configuration are read.
    pub async fn get_last_value(
        &self,
        ds: &DatasourceConfig,
        msg: &PerformanceMessage,
    ) -> ConnectorResult<Option<f64>> {
        let required = [
            ("warning_threshold", &ds.warning_threshold),
            ("critical_threshold", &ds.critical_threshold),
            ("alert_name", &ds.alert_name),
            ("routing_key", &ds.routing_key),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.is_none()) {
            return Err(ConfigurationError::MissingConfigurationData {
                host: msg.host.clone(),
                datasource: msg.datasource.clone(),
                field: *field,
            }
            .into());
        }

        let args = vec![
            "AVERAGE".to_string(),
            "--start".to_string(),
            format!("-{}", 2 * ds.step),
        ];
        let output = self
            .runner
            .run(Job::new("fetch", self.filename(msg), args), true)
            .await?;

        Ok(parse_last_value(&output))
    }

    /// Raw `fetch` output for read-only consumers
    pub async fn fetch(&self, host: &str, datasource: &str, args: Vec<String>) -> StorageResult<String> {
        let job = Job::new("fetch", self.paths.path_for(host, datasource), args);
        self.runner.run(job, true).await
    }
}

fn create_arguments(ds: &DatasourceConfig, archives: &[RetentionArchive], timestamp: i64) -> Vec<String> {
    let mut args = vec![
        "--step".to_string(),
        ds.step.to_string(),
        "--start".to_string(),
        timestamp.saturating_sub(CREATE_START_OFFSET).to_string(),
    ];
    args.extend(archives.iter().map(RetentionArchive::rra_argument));
    args.push(ds.ds_argument());
    args
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn create_parent(filename: &Path) -> StorageResult<()> {
    if let Some(parent) = filename.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Last numeric value of an `rrdtool fetch` output
///
/// Lines look like `1165939500: 1.2000000000e+01`. Other lines and NaN
/// values are skipped.
pub fn parse_last_value(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }

            let value = value.trim();
            if value.is_empty() || value.contains(char::is_whitespace) {
                return None;
            }
            if value.trim_start_matches('-').eq_ignore_ascii_case("nan") {
                return None;
            }

            value.parse::<f64>().ok().filter(|v| !v.is_nan())
        })
        .last()
}
