//! Pools of rrdtool workers
//!
//! A [`ProcessPool`] owns a fixed number of [`WorkerHandle`]s. A semaphore
//! sized to the pool bounds the number of jobs in flight, so a job that got a
//! permit always finds an idle worker. Not finding one is a bug and is
//! reported as [`PoolError::NoAvailableProcess`].
//!
//! [`PoolManager`] pairs the main pool with an optional direct pool. When
//! rrdcached sits in front of the files, values written through it may not be
//! on disk yet. Threshold checks need the real last value, so their writes
//! and reads go through a single worker that talks to the files directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use nix::unistd::{AccessFlags, access};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, instrument};

use super::backend::JobRunner;
use super::error::{PoolError, StorageResult};
use super::worker::{CACHE_ADDRESS_VAR, Job, WorkerHandle, WorkerSettings};

/// Upper bound of the default pool size
const MAX_DEFAULT_PROCESSES: usize = 4;

/// Default number of workers: one per core, at most four
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_PROCESSES)
}

/// Settings of a single pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub binary: PathBuf,
    pub base_dir: PathBuf,
    pub size: usize,
    pub env: HashMap<String, String>,
    /// Read-only pools never create the base directory
    pub readonly: bool,
}

/// Settings of the main and direct pools
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub binary: PathBuf,
    pub base_dir: PathBuf,
    pub size: usize,
    pub rrdcached: Option<String>,
    pub check_thresholds: bool,
    pub readonly: bool,
}

/// Workers of a started pool with the semaphore guarding them
struct Started {
    workers: Vec<WorkerHandle>,
    semaphore: Semaphore,
}

/// A fixed-size set of rrdtool workers
pub struct ProcessPool {
    name: String,
    settings: PoolSettings,
    state: RwLock<Option<Arc<Started>>>,
    started: AtomicBool,
}

impl ProcessPool {
    pub fn new(name: impl Into<String>, settings: PoolSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: RwLock::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured number of workers
    pub fn size(&self) -> usize {
        self.settings.size
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of workers that currently have a live process
    pub async fn alive(&self) -> usize {
        match self.state.read().await.as_ref() {
            Some(started) => started.workers.iter().filter(|w| w.pid().is_some()).count(),
            None => 0,
        }
    }

    /// Pids of the live processes, in worker order
    pub async fn pids(&self) -> Vec<u32> {
        match self.state.read().await.as_ref() {
            Some(started) => started.workers.iter().filter_map(WorkerHandle::pid).collect(),
            None => Vec::new(),
        }
    }

    /// Number of processes replaced since the pool started
    pub async fn restarts(&self) -> usize {
        match self.state.read().await.as_ref() {
            Some(started) => started.workers.iter().map(WorkerHandle::restarts).sum(),
            None => 0,
        }
    }

    /// Check the preconditions and spawn the workers
    ///
    /// Starting a started pool does nothing.
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }

        ensure_directory(&self.settings.base_dir, self.settings.readonly).await?;
        check_binary(&self.settings.binary).await?;

        let worker_settings = Arc::new(WorkerSettings {
            binary: self.settings.binary.clone(),
            env: self.settings.env.clone(),
        });

        let mut workers = Vec::with_capacity(self.settings.size);
        for index in 0..self.settings.size {
            match WorkerHandle::spawn(format!("{}-{index}", self.name), Arc::clone(&worker_settings)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    join_all(workers.iter().map(WorkerHandle::quit)).await;
                    return Err(e);
                }
            }
        }

        info!("started {} rrdtool processes", workers.len());
        *state = Some(Arc::new(Started {
            semaphore: Semaphore::new(workers.len()),
            workers,
        }));
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Quit every worker and wait until all of them are gone
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn stop(&self) {
        let Some(started) = self.state.write().await.take() else {
            return;
        };
        self.started.store(false, Ordering::Release);

        started.semaphore.close();
        let restarts: usize = started.workers.iter().map(WorkerHandle::restarts).sum();
        join_all(started.workers.iter().map(WorkerHandle::quit)).await;
        info!("stopped all rrdtool processes ({restarts} restarts)");
    }

    /// Run a job on the first idle worker, starting the pool if needed
    pub async fn run(&self, job: Job) -> StorageResult<String> {
        let started = self.started_state().await?;

        let _permit = started
            .semaphore
            .acquire()
            .await
            .map_err(|_| PoolError::Stopped)?;

        let claim = started
            .workers
            .iter()
            .find_map(WorkerHandle::try_claim)
            .ok_or(PoolError::NoAvailableProcess)?;

        claim.run(job).await
    }

    async fn started_state(&self) -> Result<Arc<Started>, PoolError> {
        if let Some(started) = self.state.read().await.as_ref() {
            return Ok(Arc::clone(started));
        }

        debug!(pool = %self.name, "pool not started yet, starting it");
        self.start().await?;

        self.state
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(PoolError::Stopped)
    }
}

/// Create the RRD directory if needed and make sure it can be used
async fn ensure_directory(directory: &Path, readonly: bool) -> Result<(), PoolError> {
    if !tokio::fs::try_exists(directory).await.unwrap_or(false) {
        if readonly {
            return Err(PoolError::MissingDirectory(directory.to_path_buf()));
        }

        create_directory(directory).await.map_err(|source| PoolError::DirectoryCreation {
            path: directory.to_path_buf(),
            source,
        })?;
        info!("created directory {}", directory.display());
    }

    if !readonly && access(directory, AccessFlags::W_OK).is_err() {
        return Err(PoolError::DirectoryNotWritable(directory.to_path_buf()));
    }

    Ok(())
}

async fn create_directory(directory: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(directory).await?;
    tokio::fs::set_permissions(directory, std::fs::Permissions::from_mode(0o755)).await
}

async fn check_binary(binary: &Path) -> Result<(), PoolError> {
    let is_file = tokio::fs::metadata(binary)
        .await
        .is_ok_and(|metadata| metadata.is_file());
    if !is_file {
        return Err(PoolError::BinaryNotFound(binary.to_path_buf()));
    }

    if access(binary, AccessFlags::X_OK).is_err() {
        return Err(PoolError::BinaryNotExecutable(binary.to_path_buf()));
    }

    Ok(())
}

/// The main pool and, when needed, the direct pool
pub struct PoolManager {
    primary: ProcessPool,
    direct: Option<ProcessPool>,
}

impl PoolManager {
    pub fn new(options: PoolOptions) -> Self {
        let mut env = HashMap::new();
        if let Some(address) = &options.rrdcached {
            env.insert(CACHE_ADDRESS_VAR.to_string(), address.clone());
        }

        let primary = ProcessPool::new(
            "rrdtool",
            PoolSettings {
                binary: options.binary.clone(),
                base_dir: options.base_dir.clone(),
                size: options.size,
                env,
                readonly: options.readonly,
            },
        );

        let direct = (options.rrdcached.is_some() && options.check_thresholds).then(|| {
            ProcessPool::new(
                "rrdtool-direct",
                PoolSettings {
                    binary: options.binary,
                    base_dir: options.base_dir,
                    size: 1,
                    env: HashMap::new(),
                    readonly: options.readonly,
                },
            )
        });

        Self { primary, direct }
    }

    pub fn primary(&self) -> &ProcessPool {
        &self.primary
    }

    pub fn direct(&self) -> Option<&ProcessPool> {
        self.direct.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.primary.is_started() && self.direct.as_ref().is_none_or(ProcessPool::is_started)
    }

    pub async fn start(&self) -> Result<(), PoolError> {
        self.primary.start().await?;
        if let Some(direct) = &self.direct {
            if let Err(e) = direct.start().await {
                self.primary.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        match &self.direct {
            Some(direct) => {
                futures::join!(self.primary.stop(), direct.stop());
            }
            None => self.primary.stop().await,
        }
    }

    fn pool_for(&self, bypass_cache: bool) -> &ProcessPool {
        match (&self.direct, bypass_cache) {
            (Some(direct), true) => direct,
            _ => &self.primary,
        }
    }
}

#[async_trait]
impl JobRunner for PoolManager {
    async fn run(&self, job: Job, bypass_cache: bool) -> StorageResult<String> {
        let pool = self.pool_for(bypass_cache);
        if bypass_cache && self.direct.is_none() {
            // No rrdcached: the main pool already writes to the files
            debug!("no direct pool, using {}", pool.name());
        }
        pool.run(job).await
    }
}
