use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::storage::PathMode;
use crate::storage::pool::{PoolOptions, default_pool_size};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// SQLite database produced by the provisioning tool
    pub confdb: PathBuf,

    /// Root of the RRD tree
    pub rrd_base_dir: PathBuf,

    #[serde(default)]
    pub rrd_path_mode: PathMode,

    #[serde(default = "default_rrd_bin")]
    pub rrd_bin: PathBuf,

    /// Address of rrdcached, passed to rrdtool as `RRDCACHED_ADDRESS`
    pub rrdcached: Option<String>,

    #[serde(default = "default_check_thresholds")]
    pub check_thresholds: bool,

    /// Number of rrdtool processes; one per core (at most 4) when absent
    pub rrd_processes: Option<usize>,

    /// Seconds between two checks of the configuration database
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            binary: self.rrd_bin.clone(),
            base_dir: self.rrd_base_dir.clone(),
            size: self
                .rrd_processes
                .filter(|&size| size > 0)
                .unwrap_or_else(default_pool_size),
            rrdcached: self.rrdcached.clone().filter(|address| !address.is_empty()),
            check_thresholds: self.check_thresholds,
            readonly: false,
        }
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval.max(1))
    }
}

fn default_rrd_bin() -> PathBuf {
    PathBuf::from("/usr/bin/rrdtool")
}

fn default_check_thresholds() -> bool {
    true
}

fn default_reload_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
