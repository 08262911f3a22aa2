//! Helper functions for integration tests

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use connector_metro::{
    MessagePipeline,
    bus::AlertSink,
    confdb::ConfigCache,
    storage::{Job, JobRunner, PathMode, PathResolver, StorageError, StorageGateway, StorageResult},
    threshold::ThresholdEvaluator,
};
use serde_json::{Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub const HOST: &str = "server1.example.com";

/// Fixed evaluation time of the test clock
pub const NOW: f64 = 1165940000.5;

/// A `perf` message for `host`/`datasource`
pub fn perf_message(host: &str, datasource: &str, timestamp: i64, value: &str) -> Value {
    json!({
        "type": "perf",
        "timestamp": timestamp,
        "host": host,
        "datasource": datasource,
        "value": value,
    })
}

/// Shell stand-in for `rrdtool -`
///
/// Every request line is appended to `journal`. Besides `create`, `update`
/// and `fetch` it understands `crash` (exit without answering), `env` (print
/// the cache address) and `fail` (answer with an error).
pub fn fake_rrdtool(dir: &Path, journal: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
while read -r cmd file rest; do
    echo "$cmd $file $rest" >> "{journal}"
    case "$cmd" in
        quit) exit 0 ;;
        crash) exit 3 ;;
        env)
            echo "address=${{RRDCACHED_ADDRESS:-none}}"
            echo "OK u:0.00 s:0.00 r:0.00"
            ;;
        create)
            : > "$file"
            echo "OK u:0.00 s:0.00 r:0.00"
            ;;
        fetch)
            echo "                          DS"
            echo ""
            echo "1165939500: 1.2000000000e+01"
            echo "1165939800: -nan"
            echo "OK u:0.00 s:0.00 r:0.00"
            ;;
        fail)
            echo "ERROR: $rest"
            ;;
        *)
            echo "OK u:0.00 s:0.00 r:0.00"
            ;;
    esac
done
"#,
        journal = journal.display()
    );

    let binary = dir.join("rrdtool");
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    binary
}

/// Lines received by the fake rrdtool so far
pub fn journal_lines(journal: &Path) -> Vec<String> {
    std::fs::read_to_string(journal)
        .unwrap_or_default()
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect()
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE perfdatasource (
        idperfdatasource INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        hostname TEXT NOT NULL,
        type TEXT NOT NULL,
        step INTEGER NOT NULL,
        heartbeat INTEGER NOT NULL,
        min REAL,
        max REAL,
        factor REAL NOT NULL DEFAULT 1.0,
        warning_threshold TEXT,
        critical_threshold TEXT,
        nagiosname TEXT,
        ventilation TEXT
    )",
    "CREATE TABLE rra (
        idrra INTEGER PRIMARY KEY,
        type TEXT NOT NULL,
        xff REAL NOT NULL,
        step INTEGER NOT NULL,
        rows INTEGER NOT NULL
    )",
    "CREATE TABLE pdsrra (
        idperfdatasource INTEGER NOT NULL,
        idrra INTEGER NOT NULL
    )",
    "INSERT INTO rra VALUES
        (1, 'AVERAGE', 0.5, 1, 600),
        (2, 'AVERAGE', 0.5, 6, 700),
        (3, 'AVERAGE', 0.5, 24, 775),
        (4, 'AVERAGE', 0.5, 288, 732)",
    // Load: plain datasource
    "INSERT INTO perfdatasource VALUES
        (1, 'Load', 'server1.example.com', 'GAUGE', 300, 600, NULL, NULL, 1.0,
         NULL, NULL, NULL, NULL)",
    // CPU: full alerting configuration, stored as a ratio
    "INSERT INTO perfdatasource VALUES
        (2, 'CPU', 'server1.example.com', 'GAUGE', 300, 600, 0, 1, 100.0,
         '80', '90', 'CPU Usage', 'vigilo-admin')",
    // Disk: thresholds but no service name
    "INSERT INTO perfdatasource VALUES
        (3, 'Disk', 'server1.example.com', 'GAUGE', 300, 600, NULL, NULL, 1.0,
         '80', '90', NULL, 'vigilo-admin')",
    // Swap: broken critical range
    "INSERT INTO perfdatasource VALUES
        (4, 'Swap', 'server1.example.com', 'GAUGE', 300, 600, NULL, NULL, 1.0,
         '80', '90:10', 'Swap Usage', 'vigilo-admin')",
    "INSERT INTO pdsrra SELECT idperfdatasource, idrra FROM perfdatasource, rra",
];

/// Write the fixture configuration database
pub async fn create_confdb(path: &Path) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    for statement in SCHEMA {
        sqlx::query(statement).execute(&db).await.unwrap();
    }
    db.close().await;
}

/// Add a datasource to an existing fixture and make its mtime advance
pub async fn add_datasource(path: &Path, id: i64, host: &str, name: &str) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Delete);
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO perfdatasource (idperfdatasource, name, hostname, type, step, heartbeat)
         VALUES (?, ?, ?, 'GAUGE', 300, 600)",
    )
    .bind(id)
    .bind(name)
    .bind(host)
    .execute(&db)
    .await
    .unwrap();
    sqlx::query("INSERT INTO pdsrra SELECT ?, idrra FROM rra")
        .bind(id)
        .execute(&db)
        .await
        .unwrap();
    db.close().await;

    touch_later(path);
}

/// Push the modification time of `path` into the future
pub fn touch_later(path: &Path) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

/// Open a loaded configuration cache on a fresh fixture
pub async fn fixture_confdb(dir: &Path) -> Arc<ConfigCache> {
    let path = dir.join("conf.db");
    create_confdb(&path).await;
    let cache = ConfigCache::open(&path).await.unwrap();
    assert!(cache.is_loaded());
    Arc::new(cache)
}

/// JobRunner that records jobs instead of running rrdtool
///
/// `create` touches the file so existence checks behave as with rrdtool.
#[derive(Default)]
pub struct RecordingRunner {
    jobs: Mutex<Vec<(Job, bool)>>,
    fetch_output: Mutex<String>,
    update_error: Mutex<Option<String>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fetch_output(&self, output: &str) {
        *self.fetch_output.lock().unwrap() = output.to_string();
    }

    pub fn fail_updates(&self, message: &str) {
        *self.update_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn jobs(&self) -> Vec<(Job, bool)> {
        self.jobs.lock().unwrap().clone()
    }

    /// Request lines, without the trailing newline
    pub fn lines(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .map(|(job, _)| job.line().trim_end().to_string())
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.jobs()
            .iter()
            .filter(|(job, _)| job.command == command)
            .count()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn run(&self, job: Job, bypass_cache: bool) -> StorageResult<String> {
        self.jobs.lock().unwrap().push((job.clone(), bypass_cache));

        match job.command.as_str() {
            "create" => {
                // Let concurrent callers overlap with the creation
                tokio::time::sleep(Duration::from_millis(20)).await;
                std::fs::write(&job.filename, b"")?;
                Ok(String::new())
            }
            "update" => {
                let error = self.update_error.lock().unwrap().clone();
                match error {
                    Some(message) => Err(StorageError::Operation {
                        filename: job.filename,
                        message,
                    }),
                    None => Ok(String::new()),
                }
            }
            "fetch" => {
                let output = self.fetch_output.lock().unwrap().clone();
                Ok(output)
            }
            _ => Ok(String::new()),
        }
    }
}

/// Gateway over `runner` storing files under `base`
pub fn gateway(
    runner: Arc<RecordingRunner>,
    confdb: Arc<ConfigCache>,
    base: &Path,
    mode: PathMode,
) -> Arc<StorageGateway> {
    Arc::new(StorageGateway::new(
        runner,
        confdb,
        PathResolver::new(base, mode),
    ))
}

/// Pipeline with a threshold evaluator sending to `sink` at [`NOW`]
pub fn pipeline_with_alerts(
    confdb: Arc<ConfigCache>,
    gateway: Arc<StorageGateway>,
    sink: Arc<dyn AlertSink>,
) -> MessagePipeline {
    let evaluator = ThresholdEvaluator::with_clock(
        confdb.clone(),
        gateway.clone(),
        Some(sink),
        Arc::new(|| NOW),
    );
    MessagePipeline::new(confdb, gateway, Some(Arc::new(evaluator)))
}
