//! OS-process workers and their line-based control channel.
//!
//! # Protocol
//! ```text
//! worker stdout → master:  "listening"    all listeners bound
//! master → worker stdin:   "disconnect"   stop accepting, drain, exit
//!                          <EOF>          same as "disconnect" (master went away)
//! ```
//! Worker logs go to stderr so stdout carries nothing but protocol lines.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::WorkerServer;
use crate::lifecycle::signals::spawn_worker_signals;
use crate::lifecycle::Shutdown;
use crate::modules::ModuleRegistry;
use crate::supervisor::worker::{EventSender, WorkerEvent, WorkerHandle, WorkerId, WorkerSpawner};

pub const LISTENING: &str = "listening";
pub const DISCONNECT: &str = "disconnect";

/// Re-executes a gateway binary with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    config_path: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
        }
    }

    /// Spawn workers from the currently running executable.
    pub fn current_exe(config_path: &Path) -> Result<Self, GatewayError> {
        let program = std::env::current_exe().map_err(|e| GatewayError::spawn(format!("cannot locate executable: {}", e)))?;
        Ok(Self::new(program, config_path))
    }
}

enum Control {
    Disconnect,
    Kill,
}

impl WorkerSpawner for ProcessSpawner {
    /// Workers load the config file themselves; the master's copy only sizes the pool.
    fn spawn(
        &self,
        id: WorkerId,
        _config: Arc<GatewayConfig>,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, GatewayError> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::spawn(format!("{}: {}", self.program.display(), e)))?;

        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_worker_messages(id, stdout, events.clone()));
        }
        let stdin = child.stdin.take();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise_child(id, child, stdin, control_rx, events));

        Ok(Box::new(ProcessHandle {
            id,
            pid,
            control: control_tx,
        }))
    }
}

struct ProcessHandle {
    id: WorkerId,
    pid: u32,
    control: mpsc::UnboundedSender<Control>,
}

impl WorkerHandle for ProcessHandle {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    fn kill(&self) {
        let _ = self.control.send(Control::Kill);
    }
}

async fn read_worker_messages(id: WorkerId, stdout: ChildStdout, events: EventSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == LISTENING => {
                let _ = events.send(WorkerEvent::Listening(id));
            }
            Ok(Some(line)) => tracing::debug!(worker_id = id, message = %line, "Unknown worker message"),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Worker stdout closed with error");
                return;
            }
        }
    }
}

/// Owns the child: forwards control requests and reports its exit.
async fn supervise_child(
    id: WorkerId,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: EventSender,
) {
    let mut control_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            message = control.recv(), if control_open => match message {
                Some(Control::Disconnect) => {
                    // Dropping the pipe afterwards closes stdin, which the worker also reads as disconnect.
                    if let Some(mut pipe) = stdin.take() {
                        let line = format!("{}\n", DISCONNECT);
                        if let Err(e) = pipe.write_all(line.as_bytes()).await {
                            tracing::warn!(worker_id = id, error = %e, "Failed to send disconnect");
                        }
                    }
                }
                Some(Control::Kill) => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(worker_id = id, error = %e, "Failed to kill worker");
                    }
                }
                None => control_open = false,
            },
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(worker_id = id, error = %e, "Failed to wait for worker");
            None
        }
    };
    let _ = events.send(WorkerEvent::Exited { id, code });
}

/// Worker-process entry point: serve until the master disconnects or SIGTERM arrives.
pub async fn run_worker_process(
    id: WorkerId,
    config: GatewayConfig,
    registry: ModuleRegistry,
) -> Result<(), GatewayError> {
    let shutdown = Shutdown::new();
    spawn_worker_signals(shutdown.clone());
    tokio::spawn(watch_master(id, shutdown.clone()));

    let server = WorkerServer::from_config(Arc::new(config), &registry)?;
    let listeners = server.bind().await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{}\n", LISTENING).as_bytes()).await?;
    stdout.flush().await?;
    tracing::info!(
        worker_id = id,
        pid = std::process::id(),
        addresses = ?listeners.local_addrs(),
        "Worker listening"
    );

    server.serve(listeners, shutdown).await?;
    tracing::info!(worker_id = id, "Worker drained");
    Ok(())
}

async fn watch_master(id: WorkerId, shutdown: Shutdown) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == DISCONNECT => break,
            Ok(Some(line)) => tracing::debug!(worker_id = id, message = %line, "Unknown master message"),
            Ok(None) => {
                tracing::warn!(worker_id = id, "Master channel closed");
                break;
            }
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Master channel failed");
                break;
            }
        }
    }
    tracing::info!(worker_id = id, "Disconnected by master, draining");
    shutdown.trigger();
}
