//! ConnectorActor - Serializes bus messages through the pipeline
//!
//! The actor takes one message at a time and runs it end to end before
//! picking the next one. Two samples for the same file can therefore never
//! be dispatched to two workers at once.
//!
//! ## Reload
//!
//! The configuration database is checked every `reload_interval`, and on
//! demand through [`ConnectorHandle::reload`]. Both are no-ops while the file
//! did not change.
//!
//! ## Fatal errors
//!
//! A pool invariant violation stops the pools and the actor. Every later
//! request fails with [`ConnectorError::Unavailable`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::messages::ConnectorCommand;
use crate::error::{ConnectorError, ConnectorResult};
use crate::pipeline::{ConnectorStats, MessagePipeline, ProcessOutcome};
use crate::storage::{PoolError, PoolManager};

const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

pub struct ConnectorActor {
    pipeline: Arc<MessagePipeline>,
    pools: Arc<PoolManager>,
    command_rx: mpsc::Receiver<ConnectorCommand>,
    reload_interval: Duration,
}

impl ConnectorActor {
    pub fn new(
        pipeline: Arc<MessagePipeline>,
        pools: Arc<PoolManager>,
        command_rx: mpsc::Receiver<ConnectorCommand>,
        reload_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            pools,
            command_rx,
            reload_interval: reload_interval.max(MIN_RELOAD_INTERVAL),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting connector actor");

        let mut reload = time::interval_at(Instant::now() + self.reload_interval, self.reload_interval);
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down");
                        self.pools.stop().await;
                        break;
                    };

                    match cmd {
                        ConnectorCommand::Start { respond_to } => {
                            let result = self.pools.start().await;
                            if result.is_ok() {
                                self.pipeline.reset_illegal_updates();
                            }
                            let _ = respond_to.send(result);
                        }

                        ConnectorCommand::Process { message, respond_to } => {
                            let result = self.pipeline.process(&message).await;
                            let fatal = matches!(&result, Err(e) if e.is_fatal());
                            let _ = respond_to.send(result);

                            if fatal {
                                error!("stopping the connector after a fatal error");
                                self.pools.stop().await;
                                break;
                            }
                        }

                        ConnectorCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.pipeline.stats().await);
                        }

                        ConnectorCommand::IsConnected { respond_to } => {
                            let _ = respond_to.send(self.pools.is_started());
                        }

                        ConnectorCommand::Reload { respond_to } => {
                            info!("reloading the configuration");
                            let _ = respond_to.send(self.reload().await);
                        }

                        ConnectorCommand::PauseAlerts => {
                            if let Some(evaluator) = self.pipeline.evaluator() {
                                evaluator.pause();
                            }
                        }

                        ConnectorCommand::ResumeAlerts => {
                            if let Some(evaluator) = self.pipeline.evaluator() {
                                evaluator.resume();
                            }
                        }

                        ConnectorCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            self.pools.stop().await;
                            let _ = respond_to.send(());
                            break;
                        }
                    }
                }

                _ = reload.tick() => {
                    self.reload().await;
                }
            }
        }

        debug!("connector actor stopped");
    }

    async fn reload(&self) -> bool {
        match self.pipeline.confdb().reload().await {
            Ok(reloaded) => reloaded,
            Err(e) => {
                warn!("could not reload the configuration database: {e}");
                false
            }
        }
    }
}

/// Handle for talking to the ConnectorActor
#[derive(Clone)]
pub struct ConnectorHandle {
    sender: mpsc::Sender<ConnectorCommand>,
}

impl ConnectorHandle {
    /// Spawn a new connector actor
    pub fn spawn(
        pipeline: Arc<MessagePipeline>,
        pools: Arc<PoolManager>,
        reload_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = ConnectorActor::new(pipeline, pools, cmd_rx, reload_interval);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Start the rrdtool pools
    pub async fn start(&self) -> Result<(), PoolError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectorCommand::Start { respond_to: tx })
            .await
            .map_err(|_| PoolError::Stopped)?;

        rx.await.map_err(|_| PoolError::Stopped)?
    }

    /// Process one bus message
    pub async fn process(&self, message: Value) -> ConnectorResult<ProcessOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectorCommand::Process {
                message,
                respond_to: tx,
            })
            .await
            .map_err(|_| ConnectorError::Unavailable)?;

        rx.await.map_err(|_| ConnectorError::Unavailable)?
    }

    pub async fn stats(&self) -> Option<ConnectorStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectorCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Whether the connector can store messages
    pub async fn is_connected(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectorCommand::IsConnected { respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Reload the configuration; returns whether it changed
    pub async fn reload(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectorCommand::Reload { respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    pub async fn pause_alerts(&self) {
        let _ = self.sender.send(ConnectorCommand::PauseAlerts).await;
    }

    pub async fn resume_alerts(&self) {
        let _ = self.sender.send(ConnectorCommand::ResumeAlerts).await;
    }

    /// Stop the pools and wait until every worker is gone
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConnectorCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
