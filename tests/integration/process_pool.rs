//! Integration tests for the rrdtool process pools
//!
//! These tests run a shell stand-in for `rrdtool -` and verify:
//! - The line protocol (output, errors)
//! - Crash detection and respawn
//! - Startup checks
//! - Routing between the cached and the direct pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use connector_metro::storage::{
    Job, JobRunner, PoolError, PoolManager, PoolOptions, ProcessPool, StorageError,
    pool::PoolSettings,
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn settings(binary: std::path::PathBuf, base_dir: std::path::PathBuf, size: usize) -> PoolSettings {
    PoolSettings {
        binary,
        base_dir,
        size,
        env: HashMap::new(),
        readonly: false,
    }
}

fn job(command: &str) -> Job {
    Job::new(command, "/tmp/test.rrd", vec!["arg".to_string()])
}

#[tokio::test]
async fn test_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("journal");
    let binary = fake_rrdtool(dir.path(), &journal);
    let pool = ProcessPool::new("test", settings(binary, dir.path().to_path_buf(), 1));

    assert_eq!(pool.run(job("update")).await.unwrap(), "");

    let output = pool.run(job("fetch")).await.unwrap();
    assert_eq!(
        output,
        "                          DS\n\n1165939500: 1.2000000000e+01\n1165939800: -nan"
    );
    assert_eq!(
        connector_metro::storage::parse_last_value(&output),
        Some(12.0)
    );

    let result = pool
        .run(Job::new("fail", "/tmp/test.rrd", vec!["opening failed".to_string()]))
        .await;
    assert_matches!(
        result,
        Err(StorageError::Operation { message, .. }) if message == "opening failed"
    );

    // The worker survives an error answer
    assert_eq!(pool.run(job("update")).await.unwrap(), "");
    assert_eq!(pool.alive().await, 1);

    pool.stop().await;
}

#[tokio::test]
async fn test_lazy_start() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let pool = ProcessPool::new("test", settings(binary, dir.path().to_path_buf(), 2));

    assert!(!pool.is_started());
    assert_eq!(pool.alive().await, 0);

    pool.run(job("update")).await.unwrap();
    assert!(pool.is_started());
    assert_eq!(pool.alive().await, 2);

    // Starting again keeps the same processes
    let pids = pool.pids().await;
    pool.start().await.unwrap();
    assert_eq!(pool.pids().await, pids);

    pool.stop().await;
    assert!(!pool.is_started());
    assert_eq!(pool.alive().await, 0);
}

#[tokio::test]
async fn test_crash_respawn() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let pool = ProcessPool::new("test", settings(binary, dir.path().to_path_buf(), 2));
    pool.start().await.unwrap();
    let before = pool.pids().await;
    assert_eq!(before.len(), 2);

    let result = pool.run(job("crash")).await;
    assert_matches!(result, Err(StorageError::ProcessExited { .. }));

    assert_eq!(pool.alive().await, 2);
    let after = pool.pids().await;
    assert_eq!(after.len(), 2);
    assert_ne!(after, before);
    assert_eq!(pool.restarts().await, 1);

    assert_eq!(pool.run(job("update")).await.unwrap(), "");
    pool.stop().await;
}

#[tokio::test]
async fn test_killed_process_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let pool = ProcessPool::new("test", settings(binary, dir.path().to_path_buf(), 1));
    pool.start().await.unwrap();
    let pid = pool.pids().await[0];

    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    // Killed right after its start, so the restart waits a second
    let mut replaced = false;
    for _ in 0..250 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pids = pool.pids().await;
        if pids.len() == 1 && pids[0] != pid {
            replaced = true;
            break;
        }
    }
    assert!(replaced, "worker should have been respawned");
    assert_eq!(pool.restarts().await, 1);

    assert_eq!(pool.run(job("update")).await.unwrap(), "");
    pool.stop().await;
}

#[tokio::test]
async fn test_concurrent_jobs_never_lack_a_worker() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let pool = Arc::new(ProcessPool::new(
        "test",
        settings(binary, dir.path().to_path_buf(), 2),
    ));
    pool.start().await.unwrap();

    let jobs = (0..20).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.run(Job::new("update", format!("/tmp/{i}.rrd"), vec![format!("{i}:1")]))
                .await
        })
    });

    for result in futures::future::join_all(jobs).await {
        assert_eq!(result.unwrap().unwrap(), "");
    }

    pool.stop().await;
}

#[tokio::test]
async fn test_startup_errors() {
    let dir = tempfile::tempdir().unwrap();

    let pool = ProcessPool::new(
        "test",
        settings(dir.path().join("missing"), dir.path().to_path_buf(), 1),
    );
    assert_matches!(pool.start().await, Err(PoolError::BinaryNotFound(_)));
    assert!(!pool.is_started());

    // The lazy start reports the same error
    assert_matches!(
        pool.run(job("update")).await,
        Err(StorageError::Pool(PoolError::BinaryNotFound(_)))
    );

    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let mut readonly = settings(binary, dir.path().join("absent"), 1);
    readonly.readonly = true;
    let pool = ProcessPool::new("test", readonly);
    assert_matches!(pool.start().await, Err(PoolError::MissingDirectory(_)));
}

#[tokio::test]
async fn test_base_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let binary = fake_rrdtool(dir.path(), &dir.path().join("journal"));
    let base = dir.path().join("var").join("rrds");

    let pool = ProcessPool::new("test", settings(binary, base.clone(), 1));
    pool.start().await.unwrap();
    assert!(base.is_dir());
    pool.stop().await;
}

fn manager_options(dir: &std::path::Path, rrdcached: Option<&str>) -> PoolOptions {
    PoolOptions {
        binary: fake_rrdtool(dir, &dir.join("journal")),
        base_dir: dir.to_path_buf(),
        size: 2,
        rrdcached: rrdcached.map(str::to_string),
        check_thresholds: true,
        readonly: false,
    }
}

#[tokio::test]
async fn test_dual_pool_routing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PoolManager::new(manager_options(dir.path(), Some("unix:/run/rrdcached.sock")));
    manager.start().await.unwrap();
    assert!(manager.is_started());
    assert_eq!(manager.direct().unwrap().alive().await, 1);

    let env = Job::new("env", "/tmp/test.rrd", vec![]);
    assert_eq!(
        manager.run(env.clone(), false).await.unwrap(),
        "address=unix:/run/rrdcached.sock"
    );
    assert_eq!(manager.run(env.clone(), true).await.unwrap(), "address=none");

    // Every bypassing job lands on the direct pool
    for _ in 0..5 {
        assert_eq!(manager.run(env.clone(), true).await.unwrap(), "address=none");
    }

    manager.stop().await;
    assert!(!manager.is_started());
    assert_eq!(manager.primary().alive().await, 0);
    assert_eq!(manager.direct().unwrap().alive().await, 0);
}

#[tokio::test]
async fn test_single_pool_without_rrdcached() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PoolManager::new(manager_options(dir.path(), None));
    assert!(manager.direct().is_none());

    let env = Job::new("env", "/tmp/test.rrd", vec![]);
    assert_eq!(manager.run(env.clone(), true).await.unwrap(), "address=none");
    assert_eq!(manager.run(env, false).await.unwrap(), "address=none");

    manager.stop().await;
}
