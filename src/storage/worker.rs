//! WorkerActor - Owns one long-lived rrdtool process
//!
//! rrdtool runs in pipe mode (`rrdtool -`): it reads one command per line on
//! stdin and answers on stdout with any number of output lines followed by a
//! status line.
//!
//! ```text
//! > fetch /var/lib/rrd/host/Load.rrd AVERAGE --start -600
//! <                       DS
//! <
//! < 1165939500: 1.2000000000e+01
//! < OK u:0.00 s:0.00 r:0.00
//! ```
//!
//! A status line starting with `ERROR: ` fails the job with the rest of the
//! line as message.
//!
//! ## Crash handling
//!
//! The actor watches its child between jobs. When the process dies, the job in
//! flight (if any) is failed first, then a replacement is spawned. A failed
//! spawn is retried every second until the actor is told to quit, and so is
//! a process that died within a second of being started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, instrument, trace, warn};

use super::error::{PoolError, StorageError, StorageResult};

/// Environment variable rrdtool reads to talk to rrdcached
pub const CACHE_ADDRESS_VAR: &str = "RRDCACHED_ADDRESS";

const RESPAWN_DELAY: Duration = Duration::from_secs(1);
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One rrdtool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub command: String,
    pub filename: PathBuf,
    pub args: Vec<String>,
}

impl Job {
    pub fn new(command: impl Into<String>, filename: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            filename: filename.into(),
            args,
        }
    }

    /// The request line written to the worker
    pub fn line(&self) -> String {
        let mut line = format!("{} {}", self.command, self.filename.display());
        for arg in self.args.iter().filter(|arg| !arg.is_empty()) {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        line
    }
}

/// How worker processes are started
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub binary: PathBuf,
    /// Extra environment; without [`CACHE_ADDRESS_VAR`] the inherited one is removed
    pub env: HashMap<String, String>,
}

/// Commands that can be sent to a worker
#[derive(Debug)]
pub enum WorkerCommand {
    Run {
        job: Job,
        respond_to: oneshot::Sender<StorageResult<String>>,
    },

    /// Ask rrdtool to exit and stop the actor
    Quit { respond_to: oneshot::Sender<()> },
}

/// A running rrdtool child with its pipes
struct RrdProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl RrdProcess {
    fn spawn(name: &str, settings: &WorkerSettings) -> Result<Self, PoolError> {
        let mut command = Command::new(&settings.binary);
        command
            .arg("-")
            .envs(&settings.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !settings.env.contains_key(CACHE_ADDRESS_VAR) {
            command.env_remove(CACHE_ADDRESS_VAR);
        }

        let spawn_error = |source| PoolError::Spawn {
            binary: settings.binary.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_error(std::io::Error::other("child pipes not captured")));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(name.to_string(), stderr));
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    fn pid(&self) -> u32 {
        self.child.id().unwrap_or_default()
    }

    /// Send one job and collect its answer
    async fn execute(&mut self, job: &Job) -> StorageResult<String> {
        self.stdin
            .write_all(job.line().as_bytes())
            .await
            .map_err(StorageError::Transport)?;
        self.stdin.flush().await.map_err(StorageError::Transport)?;

        let mut output = Vec::new();
        loop {
            let Some(line) = self
                .stdout
                .next_line()
                .await
                .map_err(StorageError::Transport)?
            else {
                return Err(StorageError::ProcessExited {
                    filename: job.filename.clone(),
                });
            };

            if line.starts_with("OK ") {
                return Ok(output.join("\n"));
            }

            if let Some(message) = line.strip_prefix("ERROR: ") {
                return Err(StorageError::Operation {
                    filename: job.filename.clone(),
                    message: message.trim_end().to_string(),
                });
            }

            output.push(line);
        }
    }

    /// Graceful exit: `quit`, close stdin, wait
    async fn quit(mut self) -> Option<ExitStatus> {
        let _ = self.stdin.write_all(b"quit\n").await;
        let _ = self.stdin.flush().await;
        drop(self.stdin);

        match timeout(QUIT_TIMEOUT, self.child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                warn!("rrdtool did not quit in time, killing it");
                let _ = self.child.kill().await;
                None
            }
        }
    }
}

async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(worker = %name, "rrdtool stderr: {line}");
    }
}

/// Wait for the child to exit, or forever when there is none
async fn exited(process: &mut Option<RrdProcess>) -> std::io::Result<ExitStatus> {
    match process {
        Some(process) => process.child.wait().await,
        None => std::future::pending().await,
    }
}

/// Actor that serializes jobs onto one rrdtool process
struct WorkerActor {
    name: String,
    settings: Arc<WorkerSettings>,
    command_rx: mpsc::Receiver<WorkerCommand>,
    process: Option<RrdProcess>,
    spawned_at: Instant,
    respawn_at: Option<Instant>,
    pid: Arc<AtomicU32>,
    restarts: Arc<AtomicUsize>,
}

impl WorkerActor {
    #[instrument(skip(self), fields(worker = %self.name))]
    async fn run(mut self) {
        debug!("starting worker actor");

        loop {
            tokio::select! {
                status = exited(&mut self.process) => {
                    self.process = None;
                    self.pid.store(0, Ordering::Relaxed);
                    match status {
                        Ok(status) => warn!("rrdtool exited unexpectedly ({status})"),
                        Err(e) => warn!("rrdtool vanished: {e}"),
                    }

                    if self.spawned_at.elapsed() < RESPAWN_DELAY {
                        debug!("rrdtool died right after starting, delaying the restart");
                        self.respawn_at = Some(Instant::now() + RESPAWN_DELAY);
                    } else {
                        self.respawn();
                    }
                }

                _ = sleep_until(self.respawn_at.unwrap_or_else(Instant::now)), if self.respawn_at.is_some() => {
                    self.respawn();
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(WorkerCommand::Run { job, respond_to }) => {
                            let result = self.execute(&job).await;
                            let _ = respond_to.send(result);
                        }

                        Some(WorkerCommand::Quit { respond_to }) => {
                            self.shutdown().await;
                            let _ = respond_to.send(());
                            break;
                        }

                        None => {
                            trace!("command channel closed");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("worker actor stopped");
    }

    async fn execute(&mut self, job: &Job) -> StorageResult<String> {
        let Some(process) = self.process.as_mut() else {
            return Err(StorageError::ProcessExited {
                filename: job.filename.clone(),
            });
        };

        trace!("running {}", job.line().trim_end());
        let result = process.execute(job).await;

        if matches!(
            result,
            Err(StorageError::ProcessExited { .. } | StorageError::Transport(_))
        ) {
            // The job is already failed; only now replace the process
            if let Some(mut dead) = self.process.take() {
                let _ = dead.child.kill().await;
                if let Ok(status) = dead.child.wait().await {
                    warn!("rrdtool exited while running a job ({status})");
                }
            }
            self.pid.store(0, Ordering::Relaxed);
            self.respawn();
        }

        result
    }

    fn respawn(&mut self) {
        match RrdProcess::spawn(&self.name, &self.settings) {
            Ok(process) => {
                self.pid.store(process.pid(), Ordering::Relaxed);
                self.restarts.fetch_add(1, Ordering::Relaxed);
                self.spawned_at = Instant::now();
                info!("rrdtool restarted (pid {})", process.pid());
                self.process = Some(process);
                self.respawn_at = None;
            }
            Err(e) => {
                error!("unable to restart rrdtool: {e}");
                self.respawn_at = Some(Instant::now() + RESPAWN_DELAY);
            }
        }
    }

    async fn shutdown(&mut self) {
        self.respawn_at = None;
        self.pid.store(0, Ordering::Relaxed);
        if let Some(process) = self.process.take() {
            match process.quit().await {
                Some(status) if status.success() => info!("rrdtool exited normally"),
                Some(status) => warn!("rrdtool exited with {status}"),
                None => {}
            }
        }
    }
}

/// Handle to a worker actor
///
/// The busy flag is owned by the pool: a worker is claimed before a job is
/// sent and released when the reply has been received.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<WorkerCommand>,
    busy: Arc<AtomicBool>,
    pid: Arc<AtomicU32>,
    restarts: Arc<AtomicUsize>,
}

impl WorkerHandle {
    /// Start the rrdtool process and the actor driving it
    ///
    /// Fails when the first process cannot be spawned.
    pub fn spawn(name: String, settings: Arc<WorkerSettings>) -> Result<Self, PoolError> {
        let process = RrdProcess::spawn(&name, &settings)?;
        let pid = Arc::new(AtomicU32::new(process.pid()));
        let restarts = Arc::new(AtomicUsize::new(0));
        let (sender, command_rx) = mpsc::channel(4);

        let actor = WorkerActor {
            name,
            settings,
            command_rx,
            process: Some(process),
            spawned_at: Instant::now(),
            respawn_at: None,
            pid: Arc::clone(&pid),
            restarts: Arc::clone(&restarts),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            sender,
            busy: Arc::new(AtomicBool::new(false)),
            pid,
            restarts,
        })
    }

    /// Mark the worker busy if it is idle
    pub fn try_claim(&self) -> Option<WorkerClaim<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WorkerClaim { worker: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Pid of the current process, `None` while there is none
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// How many times the process has been replaced
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Quit the process and wait for the actor to acknowledge
    pub async fn quit(&self) {
        let (respond_to, response) = oneshot::channel();
        if self.sender.send(WorkerCommand::Quit { respond_to }).await.is_ok() {
            let _ = response.await;
        }
    }
}

/// Exclusive use of a worker for one job
pub struct WorkerClaim<'a> {
    worker: &'a WorkerHandle,
}

impl WorkerClaim<'_> {
    pub async fn run(&self, job: Job) -> StorageResult<String> {
        let (respond_to, response) = oneshot::channel();
        self.worker
            .sender
            .send(WorkerCommand::Run { job, respond_to })
            .await
            .map_err(|_| PoolError::Stopped)?;

        response.await.map_err(|_| PoolError::Stopped)?
    }
}

impl Drop for WorkerClaim<'_> {
    fn drop(&mut self) {
        self.worker.busy.store(false, Ordering::Release);
    }
}
