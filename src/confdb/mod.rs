//! Cached access to the configuration database
//!
//! The provisioning tool replaces the SQLite file whenever the configuration
//! changes. [`ConfigCache::reload`] reopens it when its modification time
//! advanced and swaps a whole new [`Snapshot`] in. Readers keep the snapshot
//! they loaded until they are done with it, so a reload never shows them a
//! half-built cache.
//!
//! ## Cold start
//!
//! Until the file exists every accessor answers with its empty value
//! (`false`, `0`, nothing found), which makes the pipeline drop every message
//! instead of failing.

pub mod schema;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigurationError, ConnectorResult};

pub use schema::{DatasourceConfig, RetentionArchive};

type DatasourceKey = (String, String);

/// One generation of the configuration
#[derive(Default)]
struct Snapshot {
    db: Option<SqlitePool>,
    /// Every host with at least one datasource
    hosts: Option<HashSet<String>>,
    /// (host, datasource) pairs carrying both thresholds
    thresholds: Option<HashSet<DatasourceKey>>,
    /// Datasources looked up with the cache enabled
    datasources: DashMap<DatasourceKey, Arc<DatasourceConfig>>,
}

/// Read-only view of the configuration database
pub struct ConfigCache {
    path: PathBuf,
    snapshot: ArcSwap<Snapshot>,
    /// Modification time of the loaded file; also serializes reloads
    loaded_at: Mutex<Option<SystemTime>>,
}

impl ConfigCache {
    /// Create a cold cache; nothing is read before [`ConfigCache::reload`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            loaded_at: Mutex::new(None),
        }
    }

    /// Create the cache and load the database if it is already there
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, sqlx::Error> {
        let cache = Self::new(path);
        cache.reload().await?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a database has been loaded
    pub fn is_loaded(&self) -> bool {
        self.snapshot.load().db.is_some()
    }

    /// Reopen the database if the file changed since the last load
    ///
    /// Returns whether a new snapshot was installed. Cheap when nothing changed.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn reload(&self) -> Result<bool, sqlx::Error> {
        let mut loaded_at = self.loaded_at.lock().await;

        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.modified()?,
            Err(_) => {
                if loaded_at.is_none() {
                    warn!("no configuration database yet");
                }
                return Ok(false);
            }
        };

        if self.is_loaded() && loaded_at.is_some_and(|previous| modified <= previous) {
            return Ok(false);
        }

        debug!("connecting to the configuration database");
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true)
            .create_if_missing(false);

        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let snapshot = Snapshot {
            hosts: load_hosts(&db).await.ok(),
            thresholds: load_thresholds(&db).await.ok(),
            db: Some(db),
            datasources: DashMap::new(),
        };

        info!(
            "configuration loaded ({} hosts)",
            snapshot.hosts.as_ref().map_or(0, HashSet::len)
        );

        // In-flight readers keep the previous pool alive until they finish
        self.snapshot.store(Arc::new(snapshot));
        *loaded_at = Some(modified);
        Ok(true)
    }

    /// Close the current database connections
    pub async fn close(&self) {
        let previous = self.snapshot.swap(Arc::new(Snapshot::default()));
        if let Some(db) = &previous.db {
            db.close().await;
        }
        *self.loaded_at.lock().await = None;
    }

    pub async fn has_host(&self, host: &str) -> Result<bool, sqlx::Error> {
        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Ok(false);
        };

        if let Some(hosts) = &snapshot.hosts {
            return Ok(hosts.contains(host));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM perfdatasource WHERE hostname = ?")
            .bind(host)
            .fetch_one(db)
            .await?;
        Ok(count > 0)
    }

    pub async fn has_threshold(&self, host: &str, datasource: &str) -> Result<bool, sqlx::Error> {
        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Ok(false);
        };

        if let Some(thresholds) = &snapshot.thresholds {
            return Ok(thresholds.contains(&(host.to_string(), datasource.to_string())));
        }

        let found = sqlx::query(
            "SELECT 1 FROM perfdatasource WHERE hostname = ? AND name = ? \
             AND warning_threshold IS NOT NULL AND critical_threshold IS NOT NULL LIMIT 1",
        )
        .bind(host)
        .bind(datasource)
        .fetch_optional(db)
        .await?;
        Ok(found.is_some())
    }

    /// Look a datasource up, memoizing it in the current snapshot when `use_cache`
    pub async fn get_datasource(
        &self,
        host: &str,
        datasource: &str,
        use_cache: bool,
    ) -> ConnectorResult<Arc<DatasourceConfig>> {
        let not_found = || ConfigurationError::NotInConfiguration {
            host: host.to_string(),
            datasource: datasource.to_string(),
        };

        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Err(not_found().into());
        };

        let key = (host.to_string(), datasource.to_string());
        if use_cache {
            if let Some(cached) = snapshot.datasources.get(&key) {
                return Ok(Arc::clone(cached.value()));
            }
        }

        let query = format!(
            "SELECT {} FROM perfdatasource WHERE name = ? AND hostname = ?",
            DatasourceConfig::COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(datasource)
            .bind(host)
            .fetch_optional(db)
            .await?
            .ok_or_else(not_found)?;

        let config = Arc::new(DatasourceConfig::from_row(&row)?);
        if use_cache {
            snapshot.datasources.insert(key, Arc::clone(&config));
        }
        Ok(config)
    }

    /// Archives of a datasource, in definition order
    pub async fn get_retention_archives(
        &self,
        datasource_id: i64,
    ) -> Result<Vec<RetentionArchive>, sqlx::Error> {
        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Ok(Vec::new());
        };

        sqlx::query(
            "SELECT rra.type, rra.xff, rra.step, rra.rows FROM rra \
             JOIN pdsrra ON pdsrra.idrra = rra.idrra \
             WHERE pdsrra.idperfdatasource = ? ORDER BY rra.idrra",
        )
        .bind(datasource_id)
        .fetch_all(db)
        .await?
        .iter()
        .map(RetentionArchive::from_row)
        .collect()
    }

    pub async fn count_datasources(&self) -> Result<i64, sqlx::Error> {
        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Ok(0);
        };

        sqlx::query_scalar("SELECT COUNT(*) FROM perfdatasource")
            .fetch_one(db)
            .await
    }

    /// Names of the datasources of a host
    pub async fn get_host_datasources(&self, host: &str) -> Result<Vec<String>, sqlx::Error> {
        let snapshot = self.snapshot.load_full();
        let Some(db) = &snapshot.db else {
            return Ok(Vec::new());
        };

        sqlx::query("SELECT name FROM perfdatasource WHERE hostname = ? ORDER BY name")
            .bind(host)
            .fetch_all(db)
            .await?
            .iter()
            .map(|row| row.try_get("name"))
            .collect()
    }
}

async fn load_hosts(db: &SqlitePool) -> Result<HashSet<String>, sqlx::Error> {
    let hosts: Vec<String> = sqlx::query_scalar("SELECT DISTINCT hostname FROM perfdatasource")
        .fetch_all(db)
        .await?;
    Ok(hosts.into_iter().collect())
}

async fn load_thresholds(db: &SqlitePool) -> Result<HashSet<DatasourceKey>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT hostname, name FROM perfdatasource \
         WHERE warning_threshold IS NOT NULL AND critical_threshold IS NOT NULL",
    )
    .fetch_all(db)
    .await?;

    rows.iter()
        .map(|row| -> Result<DatasourceKey, sqlx::Error> {
            Ok((row.try_get("hostname")?, row.try_get("name")?))
        })
        .collect()
}
