//! Integration tests for the configuration database cache

use std::sync::Arc;

use assert_matches::assert_matches;
use connector_metro::{
    ConnectorError, MessagePipeline,
    confdb::ConfigCache,
    error::ConfigurationError,
    storage::PathMode,
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let confdb = fixture_confdb(dir.path()).await;

    assert!(confdb.has_host(HOST).await.unwrap());
    assert!(!confdb.has_host("unknown.example.com").await.unwrap());
    assert!(confdb.has_threshold(HOST, "CPU").await.unwrap());
    assert!(!confdb.has_threshold(HOST, "Load").await.unwrap());
    assert_eq!(confdb.count_datasources().await.unwrap(), 4);
    assert_eq!(
        confdb.get_host_datasources(HOST).await.unwrap(),
        vec!["CPU", "Disk", "Load", "Swap"]
    );

    let cpu = confdb.get_datasource(HOST, "CPU", false).await.unwrap();
    assert_eq!(cpu.id, 2);
    assert_eq!(cpu.factor, 100.0);
    assert_eq!(cpu.min, Some(0.0));
    assert_eq!(cpu.max, Some(1.0));
    assert_eq!(cpu.alert_name.as_deref(), Some("CPU Usage"));
    assert_eq!(cpu.routing_key.as_deref(), Some("vigilo-admin"));
    assert_eq!(cpu.ds_argument(), "DS:DS:GAUGE:600:0:1");

    let archives = confdb.get_retention_archives(cpu.id).await.unwrap();
    let rras: Vec<_> = archives.iter().map(|a| a.rra_argument()).collect();
    assert_eq!(
        rras,
        vec![
            "RRA:AVERAGE:0.5:1:600",
            "RRA:AVERAGE:0.5:6:700",
            "RRA:AVERAGE:0.5:24:775",
            "RRA:AVERAGE:0.5:288:732",
        ]
    );

    assert_matches!(
        confdb.get_datasource(HOST, "Memory", true).await,
        Err(ConnectorError::Configuration(ConfigurationError::NotInConfiguration { .. }))
    );
}

#[tokio::test]
async fn test_cached_datasource_is_shared() {
    let dir = tempfile::tempdir().unwrap();
    let confdb = fixture_confdb(dir.path()).await;

    let first = confdb.get_datasource(HOST, "Load", true).await.unwrap();
    let second = confdb.get_datasource(HOST, "Load", true).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let uncached = confdb.get_datasource(HOST, "Load", false).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &uncached));
    assert_eq!(*first, *uncached);
}

#[tokio::test]
async fn test_reload_only_when_modified() {
    let dir = tempfile::tempdir().unwrap();
    let confdb = fixture_confdb(dir.path()).await;
    let path = confdb.path().to_path_buf();

    assert!(!confdb.reload().await.unwrap());
    assert!(!confdb.reload().await.unwrap());

    add_datasource(&path, 5, "server2.example.com", "Load").await;
    assert!(!confdb.has_host("server2.example.com").await.unwrap());

    assert!(confdb.reload().await.unwrap());
    assert!(confdb.has_host("server2.example.com").await.unwrap());
    assert_eq!(confdb.count_datasources().await.unwrap(), 5);

    assert!(!confdb.reload().await.unwrap());
}

#[tokio::test]
async fn test_reload_drops_cached_datasources() {
    let dir = tempfile::tempdir().unwrap();
    let confdb = fixture_confdb(dir.path()).await;

    let before = confdb.get_datasource(HOST, "Load", true).await.unwrap();
    touch_later(confdb.path());
    assert!(confdb.reload().await.unwrap());

    let after = confdb.get_datasource(HOST, "Load", true).await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn test_cold_start_then_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.db");
    let confdb = Arc::new(ConfigCache::open(&path).await.unwrap());
    assert!(!confdb.is_loaded());

    let runner = RecordingRunner::new();
    let gateway = gateway(runner.clone(), confdb.clone(), dir.path(), PathMode::Flat);
    let pipeline = MessagePipeline::new(confdb.clone(), gateway, None);

    // Everything is dropped while there is no configuration
    assert_matches!(
        pipeline
            .process(&perf_message(HOST, "Load", 1165939739, "12"))
            .await,
        Err(ConnectorError::Configuration(_))
    );
    assert!(runner.jobs().is_empty());

    create_confdb(&path).await;
    assert!(confdb.reload().await.unwrap());

    pipeline
        .process(&perf_message(HOST, "Load", 1165939739, "12"))
        .await
        .unwrap();
    assert_eq!(runner.count("create"), 1);
    assert_eq!(runner.count("update"), 1);
}

#[tokio::test]
async fn test_close_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let confdb = fixture_confdb(dir.path()).await;

    confdb.close().await;
    assert!(!confdb.is_loaded());
    assert!(!confdb.has_host(HOST).await.unwrap());
    assert_eq!(confdb.count_datasources().await.unwrap(), 0);

    // The same file is loaded again even though it did not change
    assert!(confdb.reload().await.unwrap());
    assert!(confdb.has_host(HOST).await.unwrap());
}
