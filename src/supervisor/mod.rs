//! Worker pool supervision.
//!
//! # Data Flow
//! ```text
//! signals / admin API / config watcher
//!     → SupervisorHandle (Command channel)
//!     → Supervisor::run (single task owns the worker registry)
//!         ↔ WorkerSpawner (ipc.rs: OS processes, worker.rs: tokio tasks)
//!         ← WorkerEvent (listening, exited)
//!     → PoolSnapshot (ArcSwap, read by the admin API)
//! ```
//!
//! # Responsibilities
//! - Keep the pool at its target size: a crashed worker is replaced
//! - Rolling reload: one worker at a time, successor listening before the old one is disconnected
//! - Stop: disconnect everything, exit after the last worker exits
//!
//! # Design Decisions
//! - The registry is mutated only by the supervisor task; no locking
//! - Reload is replacement-first, so the pool briefly runs N+1 workers
//! - Workers that die before listening are respawned with backoff

pub mod ipc;
pub mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{load_config, GatewayConfig};
use crate::error::GatewayError;
use crate::lifecycle::RespawnBackoff;

pub use ipc::ProcessSpawner;
pub use worker::{TaskSpawner, WorkerEvent, WorkerHandle, WorkerId, WorkerSpawner};

/// Requests the master acts on.
#[derive(Debug)]
pub enum Command {
    /// Re-read the config file (or reuse the current config) and roll the pool.
    Reload,
    /// Roll the pool onto an already loaded and validated config.
    Apply(Box<GatewayConfig>),
    /// Disconnect every worker and exit once the last one is gone.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterState {
    Starting,
    Running,
    Reloading,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Listening,
    Retiring,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: u32,
    pub state: WorkerState,
    pub generation: u64,
    /// Unix timestamp (seconds) the worker was spawned at.
    pub started_at: u64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub state: MasterState,
    pub generation: u64,
    pub target: usize,
    pub listening: usize,
    pub restarts: u64,
    pub reloads: u64,
    pub workers: Vec<WorkerInfo>,
}

impl PoolSnapshot {
    fn empty(target: usize) -> Self {
        Self {
            state: MasterState::Starting,
            generation: 0,
            target,
            listening: 0,
            restarts: 0,
            reloads: 0,
            workers: Vec::new(),
        }
    }
}

/// Cloneable control surface for a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<ArcSwap<PoolSnapshot>>,
}

impl SupervisorHandle {
    /// Returns `false` once the supervisor has exited.
    pub fn reload(&self) -> bool {
        self.commands.send(Command::Reload).is_ok()
    }

    pub fn apply(&self, config: GatewayConfig) -> bool {
        self.commands.send(Command::Apply(Box::new(config))).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.commands.send(Command::Stop).is_ok()
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Overrides the configured worker count.
    pub workers: Option<usize>,
    /// How long stopping workers may drain before they are killed.
    pub drain_timeout: Duration,
    pub backoff: RespawnBackoff,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            workers: None,
            drain_timeout: Duration::from_secs(30),
            backoff: RespawnBackoff::default(),
        }
    }
}

struct WorkerEntry {
    handle: Box<dyn WorkerHandle>,
    state: WorkerState,
    generation: u64,
    started_at: u64,
    /// Old worker this one takes over from during a rolling reload.
    replaces: Option<WorkerId>,
}

/// The master: owns the worker registry and reacts to events and commands.
pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    config: Arc<GatewayConfig>,
    config_path: Option<PathBuf>,
    options: SupervisorOptions,
    workers: BTreeMap<WorkerId, WorkerEntry>,
    next_id: WorkerId,
    generation: u64,
    state: MasterState,
    restarts: u64,
    reloads: u64,
    backoff: RespawnBackoff,
    /// Old worker whose successor is booting (or scheduled).
    replacing: Option<WorkerId>,
    scheduled_respawns: usize,
    drain_deadline: Option<Instant>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    respawn_tx: mpsc::UnboundedSender<Option<WorkerId>>,
    respawn_rx: mpsc::UnboundedReceiver<Option<WorkerId>>,
    snapshot: Arc<ArcSwap<PoolSnapshot>>,
}

impl Supervisor {
    /// `config_path` is re-read on `Reload`; without one, reload rolls the pool on the current config.
    pub fn new(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
        spawner: Arc<dyn WorkerSpawner>,
        options: SupervisorOptions,
    ) -> (Self, SupervisorHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
        let target = options.workers.unwrap_or_else(|| config.worker_count());
        let snapshot = Arc::new(ArcSwap::from_pointee(PoolSnapshot::empty(target)));

        let supervisor = Self {
            spawner,
            config: Arc::new(config),
            config_path,
            backoff: options.backoff.clone(),
            options,
            workers: BTreeMap::new(),
            next_id: 1,
            generation: 1,
            state: MasterState::Starting,
            restarts: 0,
            reloads: 0,
            replacing: None,
            scheduled_respawns: 0,
            drain_deadline: None,
            events_tx,
            events_rx,
            commands_rx,
            respawn_tx,
            respawn_rx,
            snapshot: Arc::clone(&snapshot),
        };
        let handle = SupervisorHandle {
            commands: commands_tx,
            snapshot,
        };
        (supervisor, handle)
    }

    fn target(&self) -> usize {
        self.options.workers.unwrap_or_else(|| self.config.worker_count())
    }

    /// Start the pool and supervise it until a stop completes.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let target = self.target();
        tracing::info!(workers = target, "Starting worker pool");
        for _ in 0..target {
            self.spawn_worker(None)?;
        }
        self.state = MasterState::Running;
        self.publish();

        loop {
            let deadline = self.drain_deadline;
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some(command) = self.commands_rx.recv() => self.on_command(command),
                Some(replaces) = self.respawn_rx.recv() => self.on_respawn_due(replaces),
                _ = sleep_until(deadline), if deadline.is_some() => self.kill_remaining(),
            }
            self.publish();
            if self.state == MasterState::Closing && self.workers.is_empty() {
                break;
            }
        }

        tracing::info!(restarts = self.restarts, reloads = self.reloads, "Worker pool stopped");
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        if self.state == MasterState::Closing {
            tracing::debug!(command = ?command, "Ignoring command while closing");
            return;
        }
        match command {
            Command::Reload => {
                let config = match &self.config_path {
                    Some(path) => match load_config(path) {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::error!(path = ?path, error = %e, "Reload rejected, keeping current configuration");
                            return;
                        }
                    },
                    None => (*self.config).clone(),
                };
                self.begin_reload(config);
            }
            Command::Apply(config) => self.begin_reload(*config),
            Command::Stop => self.begin_stop(),
        }
    }

    fn begin_reload(&mut self, config: GatewayConfig) {
        self.config = Arc::new(config);
        self.generation += 1;
        self.reloads += 1;
        self.state = MasterState::Reloading;
        tracing::info!(generation = self.generation, "Rolling reload started");
        self.advance_reload();
    }

    /// Start replacing the next worker from an older generation, or finish the reload.
    fn advance_reload(&mut self) {
        if self.state != MasterState::Reloading || self.replacing.is_some() {
            return;
        }
        let next = self
            .workers
            .iter()
            .find(|(_, w)| w.generation < self.generation && w.state != WorkerState::Retiring)
            .map(|(id, _)| *id);

        match next {
            Some(old) => {
                self.replacing = Some(old);
                if let Err(e) = self.spawn_worker(Some(old)) {
                    tracing::error!(worker_id = old, error = %e, "Failed to spawn successor");
                    self.schedule_respawn(Some(old));
                }
            }
            None => {
                self.state = MasterState::Running;
                tracing::info!(generation = self.generation, "Rolling reload complete");
                self.reconcile();
            }
        }
    }

    fn begin_stop(&mut self) {
        self.state = MasterState::Closing;
        self.replacing = None;
        tracing::info!(workers = self.workers.len(), "Stopping worker pool");
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.retire(id);
        }
        self.drain_deadline = Some(Instant::now() + self.options.drain_timeout);
    }

    fn kill_remaining(&mut self) {
        self.drain_deadline = None;
        tracing::warn!(workers = self.workers.len(), "Drain timeout reached, killing remaining workers");
        for entry in self.workers.values() {
            entry.handle.kill();
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Listening(id) => self.on_listening(id),
            WorkerEvent::Exited { id, code } => self.on_exit(id, code),
        }
    }

    fn on_listening(&mut self, id: WorkerId) {
        let Some(entry) = self.workers.get_mut(&id) else {
            return;
        };
        if entry.state == WorkerState::Starting {
            entry.state = WorkerState::Listening;
        }
        let replaces = entry.replaces.take();
        self.backoff.reset();
        tracing::info!(worker_id = id, pid = entry.handle.pid(), "Worker listening");

        if self.state == MasterState::Closing {
            self.retire(id);
            return;
        }
        if let Some(old) = replaces {
            if self.replacing == Some(old) {
                self.replacing = None;
                self.retire(old);
            }
        }
        self.advance_reload();
    }

    fn on_exit(&mut self, id: WorkerId, code: Option<i32>) {
        let Some(entry) = self.workers.remove(&id) else {
            return;
        };

        if self.state == MasterState::Closing || entry.state == WorkerState::Retiring {
            tracing::info!(worker_id = id, code = ?code, remaining = self.workers.len(), "Worker exited");
            return;
        }

        self.restarts += 1;
        tracing::warn!(worker_id = id, pid = entry.handle.pid(), code = ?code, "Worker exited unexpectedly");

        if self.replacing == Some(id) {
            // The old worker died while its successor boots; the successor covers the slot.
            self.replacing = None;
            for successor in self.workers.values_mut() {
                if successor.replaces == Some(id) {
                    successor.replaces = None;
                }
            }
            self.advance_reload();
            return;
        }

        let replaces = entry.replaces;
        if entry.state == WorkerState::Starting {
            self.schedule_respawn(replaces);
        } else if let Err(e) = self.spawn_worker(replaces) {
            tracing::error!(error = %e, "Failed to respawn worker");
            self.schedule_respawn(replaces);
        }
    }

    fn on_respawn_due(&mut self, replaces: Option<WorkerId>) {
        self.scheduled_respawns = self.scheduled_respawns.saturating_sub(1);
        if self.state == MasterState::Closing {
            return;
        }
        // The old worker may have exited in the meantime.
        let replaces = replaces.filter(|old| self.replacing == Some(*old));
        if let Err(e) = self.spawn_worker(replaces) {
            tracing::error!(error = %e, "Failed to respawn worker");
            self.schedule_respawn(replaces);
        }
    }

    fn schedule_respawn(&mut self, replaces: Option<WorkerId>) {
        let delay = self.backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, failures = self.backoff.failures(), "Respawn scheduled");
        self.scheduled_respawns += 1;
        let tx = self.respawn_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(replaces);
        });
    }

    /// Match the pool to its target size once no reload is in flight.
    fn reconcile(&mut self) {
        let target = self.target();
        let active: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state != WorkerState::Retiring)
            .map(|(id, _)| *id)
            .collect();
        let current = active.len() + self.scheduled_respawns;

        if current < target {
            for _ in current..target {
                if let Err(e) = self.spawn_worker(None) {
                    tracing::error!(error = %e, "Failed to grow worker pool");
                    self.schedule_respawn(None);
                }
            }
        } else if current > target {
            for id in active.into_iter().rev().take(current - target) {
                self.retire(id);
            }
        }
    }

    fn spawn_worker(&mut self, replaces: Option<WorkerId>) -> Result<WorkerId, GatewayError> {
        let id = self.next_id;
        self.next_id += 1;
        let handle = self.spawner.spawn(id, Arc::clone(&self.config), self.events_tx.clone())?;
        tracing::info!(
            worker_id = id,
            pid = handle.pid(),
            generation = self.generation,
            replaces = ?replaces,
            "Worker spawned"
        );
        self.workers.insert(
            id,
            WorkerEntry {
                handle,
                state: WorkerState::Starting,
                generation: self.generation,
                started_at: unix_now(),
                replaces,
            },
        );
        Ok(id)
    }

    fn retire(&mut self, id: WorkerId) {
        if let Some(entry) = self.workers.get_mut(&id) {
            if entry.state != WorkerState::Retiring {
                entry.state = WorkerState::Retiring;
                entry.handle.disconnect();
                tracing::info!(worker_id = id, pid = entry.handle.pid(), "Worker disconnected");
            }
        }
    }

    fn publish(&self) {
        let workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: *id,
                pid: w.handle.pid(),
                state: w.state,
                generation: w.generation,
                started_at: w.started_at,
            })
            .collect();
        self.snapshot.store(Arc::new(PoolSnapshot {
            state: self.state,
            generation: self.generation,
            target: self.target(),
            listening: workers.iter().filter(|w| w.state == WorkerState::Listening).count(),
            restarts: self.restarts,
            reloads: self.reloads,
            workers,
        }));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
