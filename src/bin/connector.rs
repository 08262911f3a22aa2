use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use connector_metro::{
    ConnectorError, MessagePipeline,
    actors::ConnectorHandle,
    bus::{AlertSink, JsonLinesSink},
    confdb::ConfigCache,
    config::{Config, read_config_file},
    storage::{JobRunner, PathResolver, PoolManager, StorageGateway},
    threshold::ThresholdEvaluator,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO);
    let filter = filter::Targets::new().with_targets(vec![
        ("connector_metro", level),
        ("connector", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = read_config_file(&args.file)?;
    init(&config.log_level);
    trace!("started with args: {args:?}");

    let (handle, pools, confdb) = build(&config).await?;

    if let Err(e) = handle.start().await {
        if e.is_startup() {
            error!("could not start rrdtool, check the configuration: {e}");
        } else {
            error!("connector stopped before rrdtool was started: {e}");
        }
        pools.stop().await;
        confdb.close().await;
        return Err(e.into());
    }
    info!(
        "connector started, {} rrdtool process(es) in {}",
        pools.primary().size(),
        config.rrd_base_dir.display()
    );

    let mut hangup = signal(SignalKind::hangup())?;
    let reload_handle = handle.clone();
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading the configuration");
            reload_handle.reload().await;
        }
    });

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = consume(&handle) => {
            debug!("input exhausted");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
        _ = terminate.recv() => {
            info!("SIGTERM received");
        }
    }

    if let Some(stats) = handle.stats().await {
        info!("final stats: {}", serde_json::to_string(&stats)?);
    }
    handle.shutdown().await;
    confdb.close().await;

    Ok(())
}

async fn build(
    config: &Config,
) -> anyhow::Result<(ConnectorHandle, Arc<PoolManager>, Arc<ConfigCache>)> {
    let confdb = Arc::new(ConfigCache::open(&config.confdb).await?);
    if !confdb.is_loaded() {
        warn!(
            "configuration database {} is not available yet",
            config.confdb.display()
        );
    }

    let pools = Arc::new(PoolManager::new(config.pool_options()));
    let paths = PathResolver::new(&config.rrd_base_dir, config.rrd_path_mode);
    let runner: Arc<dyn JobRunner> = pools.clone();
    let gateway = Arc::new(StorageGateway::new(runner, confdb.clone(), paths));

    let evaluator = config.check_thresholds.then(|| {
        let sink: Arc<dyn AlertSink> = Arc::new(JsonLinesSink::stdout());
        Arc::new(ThresholdEvaluator::new(
            confdb.clone(),
            gateway.clone(),
            Some(sink),
        ))
    });

    let pipeline = Arc::new(MessagePipeline::new(confdb.clone(), gateway, evaluator));
    let handle = ConnectorHandle::spawn(pipeline, pools.clone(), config.reload_interval());

    Ok((handle, pools, confdb))
}

/// Feed JSON lines from stdin to the connector until EOF or a fatal error
async fn consume(handle: &ConnectorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("could not read from stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<Value>(&line) {
            Ok(message) => message,
            Err(e) => {
                error!("invalid JSON message: {e}");
                continue;
            }
        };

        match handle.process(message).await {
            Ok(outcome) => trace!("stored in {}", outcome.filename.display()),
            Err(e) if e.is_fatal() => break,
            Err(ConnectorError::Unavailable) => {
                error!("connector is gone, stopping");
                break;
            }
            // already logged by the pipeline
            Err(_) => {}
        }
    }
}
