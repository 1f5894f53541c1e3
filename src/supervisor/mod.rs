//! Worker process supervisor.
//!
//! The supervisor keeps a fixed number of worker processes alive. It never
//! routes requests or talks to workers after spawning them; the only thing it
//! reacts to is a worker exiting, and the only thing it does about it is
//! spawn one replacement.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │    Supervisor    │  binds the listening socket
//!                     │  (pool, on_exit) │
//!                     └────────┬─────────┘
//!                              │ spawn / exit events
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ pipeline  │  │ pipeline  │  │ pipeline  │
//!         └───────────┘  └───────────┘  └───────────┘
//!                  accept() on the inherited socket
//! ```
//!
//! # State machine
//!
//! `Initializing` while the first N workers are spawned, then `Steady`.
//! Handling an exit passes through `Respawning(id)` and returns to `Steady`
//! within the same call, so no event is ever observed with a dead worker
//! still counted as live.

mod proc;
mod signals;
mod spawn;

pub use signals::TerminationReason;
pub use spawn::{ProcessSpawner, Spawner, share_listener, take_inherited_listener};

use crate::config::ServerConfig;
use crate::error::{FleetError, Result};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsString;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Identifier of a worker. For real processes this is the pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live worker owned by the supervisor.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// OS process, when the worker is one.
    pub pid: Option<Pid>,
    pub started_at: Instant,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, pid: Option<Pid>) -> Self {
        Self {
            id,
            pid,
            started_at: Instant::now(),
        }
    }
}

/// Exit event delivered by a worker's watcher task.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub id: WorkerId,
    pub reason: TerminationReason,
}

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Steady,
    Respawning(WorkerId),
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Steady => write!(f, "steady"),
            Self::Respawning(id) => write!(f, "respawning {}", id),
        }
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of live workers to maintain.
    pub target: usize,
    /// Attempts per slot during the initial spawn. Respawns after an exit
    /// are always attempted exactly once.
    pub initial_spawn_attempts: usize,
}

impl SupervisorConfig {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            initial_spawn_attempts: 3,
        }
    }
}

/// Owns the worker pool and reacts to worker exits.
pub struct Supervisor<S: Spawner> {
    spawner: S,
    config: SupervisorConfig,
    pool: HashMap<WorkerId, WorkerRecord>,
    state: SupervisorState,
    exits_tx: UnboundedSender<WorkerExit>,
    exits_rx: UnboundedReceiver<WorkerExit>,
    respawns: u64,
}

impl<S: Spawner> Supervisor<S> {
    pub fn new(spawner: S, config: SupervisorConfig) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            spawner,
            config,
            pool: HashMap::new(),
            state: SupervisorState::Initializing,
            exits_tx,
            exits_rx,
            respawns: 0,
        }
    }

    /// Spawn the initial workers. Returns how many are live.
    ///
    /// A slot whose spawn fails is retried immediately, up to
    /// `initial_spawn_attempts` times; after that it stays empty.
    pub fn start(&mut self) -> usize {
        self.state = SupervisorState::Initializing;
        info!(target_workers = self.config.target, "Spawning workers");

        for slot in 0..self.config.target {
            for attempt in 1..=self.config.initial_spawn_attempts.max(1) {
                match self.spawner.spawn(&self.exits_tx) {
                    Ok(record) => {
                        info!(worker = %record.id, slot, "Worker spawned");
                        self.pool.insert(record.id, record);
                        break;
                    }
                    Err(e) => {
                        error!(slot, attempt, error = %e, "Error spawning worker");
                    }
                }
            }
        }

        let live = self.pool.len();
        if live < self.config.target {
            warn!(
                live,
                target_workers = self.config.target,
                "Worker pool is undersized after startup"
            );
        }
        self.state = SupervisorState::Steady;
        live
    }

    /// Handle a worker exit: drop its record and spawn exactly one replacement.
    ///
    /// Exits for workers not in the pool are ignored. Returns the id of the
    /// replacement, or `None` if nothing was spawned.
    pub fn on_exit(&mut self, exit: WorkerExit) -> Option<WorkerId> {
        let Some(record) = self.pool.remove(&exit.id) else {
            debug!(worker = %exit.id, "Ignoring exit of unknown worker");
            return None;
        };

        let uptime_secs = record.started_at.elapsed().as_secs();
        if exit.reason.is_success() {
            info!(worker = %exit.id, uptime_secs, "Worker exited. Spawning a new process...");
        } else {
            warn!(
                worker = %exit.id,
                reason = %exit.reason,
                uptime_secs,
                "Worker died. Spawning a new process..."
            );
        }

        self.state = SupervisorState::Respawning(exit.id);
        let replacement = match self.spawner.spawn(&self.exits_tx) {
            Ok(record) => {
                let id = record.id;
                self.respawns += 1;
                info!(worker = %id, replaces = %exit.id, respawns = self.respawns, "Worker respawned");
                self.pool.insert(id, record);
                Some(id)
            }
            Err(e) => {
                error!(replaces = %exit.id, error = %e, live = self.pool.len(), "Error respawning worker");
                None
            }
        };
        self.state = SupervisorState::Steady;
        replacement
    }

    /// Wait for the next worker exit event.
    #[cfg(test)]
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        self.exits_rx.recv().await
    }

    /// Spawn the pool and supervise it until the process is told to stop.
    ///
    /// Fails without supervising anything if no worker could be started.
    pub async fn run(mut self) -> Result<()> {
        if self.start() == 0 {
            return Err(FleetError::Spawn("no worker could be started".to_string()));
        }

        let shutdown = crate::server::shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Workers exiting because of the same Ctrl+C must not be respawned
                biased;
                _ = &mut shutdown => {
                    info!(
                        state = %self.state(),
                        live = self.live_count(),
                        respawns = self.respawns(),
                        "Supervisor stopping"
                    );
                    self.terminate_all();
                    return Ok(());
                }
                Some(exit) = self.exits_rx.recv() => {
                    self.on_exit(exit);
                }
            }
        }
    }

    /// Send SIGTERM to every live worker process.
    pub fn terminate_all(&self) {
        for record in self.pool.values() {
            if let Some(pid) = record.pid
                && let Err(e) = proc::terminate(pid)
            {
                warn!(worker = %record.id, error = %e, "Failed to stop worker");
            }
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn live_count(&self) -> usize {
        self.pool.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.pool.contains_key(&id)
    }

    /// Ids of live workers, sorted.
    #[cfg(test)]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.pool.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of successful respawns since startup.
    pub fn respawns(&self) -> u64 {
        self.respawns
    }
}

/// Bind the shared listener and supervise workers for `config`.
///
/// `worker_args` are the arguments (without argv[0]) workers are started
/// with; `--internal-worker` is appended.
pub async fn run(config: ServerConfig, worker_args: Vec<OsString>) -> Result<()> {
    if config.environment.is_production() {
        info!(workers = config.workers, "Web cluster launching in hosted mode");
    } else {
        info!(workers = config.workers, "Web cluster launching in local mode");
    }

    let listener = std::net::TcpListener::bind(config.bind_addr())?;
    let addr = listener.local_addr()?;
    let fd = share_listener(&listener)?;
    info!(address = %addr, "Listening");

    let spawner = ProcessSpawner::for_current_exe(worker_args, config.environment, fd)?;
    let supervisor = Supervisor::new(spawner, SupervisorConfig::new(config.workers));
    let result = supervisor.run().await;

    drop(listener);
    result
}
