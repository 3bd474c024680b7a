//! Agent process spawning and I/O management.
//!
//! This module owns the OS-level side of an agent:
//! - Spawning the process with its working directory and environment
//! - Forwarding raw stdout chunks and stderr lines over a channel
//! - Writing lines to stdin with a bounded timeout
//! - Graceful termination with escalation to a forced kill
//!
//! Every process produces exactly one [`ProcessEvent::Exit`], emitted after
//! stdin has been closed and all stdout has been forwarded. The child is
//! always reaped by the task that watches it.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::shell::{build_agent_command, AgentExit};

const READ_CHUNK: usize = 8 * 1024;

/// How long the exit watcher waits for output readers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Events emitted by an agent process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Raw bytes read from stdout (not aligned to lines)
    Stdout(Vec<u8>),
    /// A line was read from stderr
    Stderr(String),
    /// The process exited
    Exit(AgentExit),
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Working directory is not a directory: {0}")]
    InvalidWorkingDir(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn {binary}: {source}")]
    Io {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Process is not running")]
    NotRunning,

    #[error("Timed out writing to process stdin")]
    Timeout,

    #[error("Failed to write to process stdin: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            SendError::NotRunning
        } else {
            SendError::Io(err)
        }
    }
}

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Name or path of the agent binary
    pub binary_path: String,
    /// Arguments to pass to the binary
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Extra environment (credentials, bundle variables)
    pub env: BTreeMap<String, String>,
    /// Custom shell prefix (e.g., "/bin/zsh -l -c")
    pub shell_prefix: Option<String>,
    /// Upper bound for a single stdin write
    pub send_timeout: Duration,
    /// Upper bound for a forced kill to be confirmed
    pub kill_escalation: Duration,
}

impl SpawnConfig {
    /// Create a new spawn config with required fields.
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
            shell_prefix: None,
            send_timeout: Duration::from_secs(5),
            kill_escalation: Duration::from_secs(2),
        }
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variables; later values win.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set a custom shell prefix.
    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    /// Set the stdin write and kill escalation bounds.
    pub fn timeouts(mut self, send_timeout: Duration, kill_escalation: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.kill_escalation = kill_escalation;
        self
    }
}

/// A running agent process.
///
/// The handle never blocks: writes are bounded by the send timeout and
/// `kill` by the grace period plus the escalation bound. Dropping the handle
/// kills the process.
pub struct AgentProcess {
    config: SpawnConfig,
    pid: Option<u32>,
    stdin: SharedStdin,
    kill_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    exit_rx: watch::Receiver<Option<AgentExit>>,
}

impl AgentProcess {
    /// Spawn a new agent process.
    ///
    /// Returns the handle and the receiver for its [`ProcessEvent`]s. Output
    /// readers and the exit watcher run as tokio tasks, so this must be
    /// called from within a runtime.
    pub async fn spawn(
        config: SpawnConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), SpawnError> {
        let mut cmd = build_agent_command(
            &config.binary_path,
            &config.args,
            config.working_dir.as_deref(),
            config.shell_prefix.as_deref(),
        )?;
        cmd.envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SpawnError::BinaryNotFound(config.binary_path.clone()),
            _ => SpawnError::Io {
                binary: config.binary_path.clone(),
                source: e,
            },
        })?;
        let pid = child.id();

        let missing = |stream: &str| SpawnError::Io {
            binary: config.binary_path.clone(),
            source: std::io::Error::other(format!("Failed to capture {stream}")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        log::info!(
            "Spawned agent process {} (pid {:?}) in {:?}",
            config.binary_path,
            pid,
            config.working_dir
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdout_task = tokio::spawn(read_stdout(stdout, tx.clone()));
        let stderr_task = tokio::spawn(read_stderr(stderr, tx.clone()));

        let process = Self {
            config,
            pid,
            stdin: Arc::new(tokio::sync::Mutex::new(Some(stdin))),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        };

        tokio::spawn(watch_exit(
            child,
            kill_rx,
            Arc::clone(&process.stdin),
            [stdout_task, stderr_task],
            tx,
            exit_tx,
        ));

        Ok((process, rx))
    }

    /// Spawn a fresh instance from this process's original configuration.
    pub async fn relaunch(
        &self,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), SpawnError> {
        Self::spawn(self.config.clone()).await
    }

    /// Write a line to stdin.
    pub async fn send(&self, data: &str) -> Result<(), SendError> {
        if self.has_exited() {
            return Err(SendError::NotRunning);
        }
        let write = async {
            let mut guard = self.stdin.lock().await;
            let stdin = guard.as_mut().ok_or(SendError::NotRunning)?;
            stdin.write_all(data.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok(())
        };
        tokio::time::timeout(self.config.send_timeout, write)
            .await
            .map_err(|_| SendError::Timeout)?
    }

    /// Close stdin so the process sees end of input. Further sends fail.
    pub async fn close_stdin(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Terminate the process: SIGTERM, then a forced kill once `grace` elapses.
    ///
    /// Idempotent. Returns once the exit has been observed or the escalation
    /// bound has passed.
    pub async fn kill(&self, grace: Duration) {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(grace);
        }

        let mut exit_rx = self.exit_rx.clone();
        let bound = grace + self.config.kill_escalation;
        if tokio::time::timeout(bound, exit_rx.wait_for(Option::is_some))
            .await
            .is_err()
        {
            log::error!(
                "Process {:?} did not confirm exit within {:?}",
                self.pid,
                bound
            );
        }
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> AgentExit {
        let mut exit_rx = self.exit_rx.clone();
        let exit = match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| AgentExit::unknown(false))
    }

    /// Exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<AgentExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Check if the process is still running.
    pub fn is_running(&self) -> bool {
        !self.has_exited()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The configuration this process was spawned with.
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        let kill_tx = self
            .kill_tx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(Duration::ZERO);
        }
    }
}

async fn read_stdout(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<ProcessEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Failed to read agent stdout: {}", e);
                break;
            }
        }
    }
}

async fn read_stderr(stderr: ChildStderr, tx: mpsc::UnboundedSender<ProcessEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(ProcessEvent::Stderr(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read agent stderr: {}", e);
                break;
            }
        }
    }
}

/// Own the child until it exits, then report the exit exactly once.
async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<Duration>,
    stdin: SharedStdin,
    readers: [JoinHandle<()>; 2],
    tx: mpsc::UnboundedSender<ProcessEvent>,
    exit_tx: watch::Sender<Option<AgentExit>>,
) {
    let pid = child.id();
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => AgentExit::from_status(status, false),
            Err(e) => {
                log::warn!("Failed to wait on agent process {:?}: {}", pid, e);
                AgentExit::unknown(false)
            }
        },
        Ok(grace) = kill_rx => match terminate(&mut child, grace).await {
            Ok(status) => AgentExit::from_status(status, true),
            Err(e) => {
                log::warn!("Failed to terminate agent process {:?}: {}", pid, e);
                AgentExit::unknown(true)
            }
        },
    };

    // Input closes before anyone hears about the exit.
    stdin.lock().await.take();

    for reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            log::debug!("Output reader for {:?} still open after exit", pid);
        }
    }

    log::info!("Agent process {:?} exited: {:?}", pid, exit);
    exit_tx.send_replace(Some(exit.clone()));
    let _ = tx.send(ProcessEvent::Exit(exit));
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if !grace.is_zero() {
            // SAFETY: the child has not been reaped, so `pid` still names it.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            log::warn!("Agent process {} ignored SIGTERM for {:?}, killing", pid, grace);
        }
    }

    child.kill().await?;
    child.wait().await
}

// ============================================================================
// TESTS
// ============================================================================
