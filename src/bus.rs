//! Outbound side of the bus
//!
//! The threshold evaluator only needs something that reports whether it is
//! connected and accepts alert commands. The transport itself lives outside
//! this crate; [`JsonLinesSink`] writes one JSON object per line for whoever
//! forwards it, [`ChannelSink`] hands commands to an in-process consumer.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{trace, warn};

/// Nagios external command carrying a passive check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NagiosCommand {
    #[serde(rename = "type")]
    pub message_type: String,
    pub routing_key: String,
    /// Unix seconds
    pub timestamp: f64,
    pub host: String,
    pub cmdname: String,
    /// `{host};{service};{state};{message}`
    pub value: String,
}

/// Receiver of alert commands
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Alerts are only produced while this returns `true`
    fn is_connected(&self) -> bool;

    async fn send(&self, command: NagiosCommand) -> anyhow::Result<()>;
}

/// Writes commands as JSON lines
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
    connected: AtomicBool,
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> AlertSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, command: NagiosCommand) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&command).context("failed to serialize alert")?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("alert output closed: {e}");
            self.connected.store(false, Ordering::Relaxed);
            return Err(e).context("failed to write alert");
        }

        trace!("sent alert for {}", command.host);
        Ok(())
    }
}

/// Forwards commands to an mpsc channel
pub struct ChannelSink {
    sender: mpsc::Sender<NagiosCommand>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NagiosCommand>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: NagiosCommand) -> anyhow::Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("alert receiver dropped"))
    }
}
