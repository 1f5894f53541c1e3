//! Worker subprocess spawning.
//!
//! Workers are the current executable re-run with `--internal-worker`. The
//! supervisor binds the listening socket once and clears its close-on-exec
//! flag, so every worker inherits the same socket and the kernel spreads
//! incoming connections across them.

use super::proc::WorkerProc;
use super::{WorkerExit, WorkerId, WorkerRecord};
use crate::config::Environment;
use crate::error::{FleetError, Result};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use std::ffi::OsString;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

/// Environment variable carrying the inherited listener fd.
pub const LISTEN_FD_ENV: &str = "WEBFLEET_LISTEN_FD";

/// Environment variable carrying the resolved environment to workers.
pub const ENVIRONMENT_ENV: &str = "WEBFLEET_ENV";

/// Creates worker processes for the supervisor.
///
/// A successful spawn returns the new worker's record and arranges for a
/// [`WorkerExit`] to be sent on `exits` once that worker terminates. The call
/// itself must not wait for the worker.
pub trait Spawner {
    fn spawn(&mut self, exits: &UnboundedSender<WorkerExit>) -> Result<WorkerRecord>;
}

/// Spawns real OS processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    /// Spawn `program args...` for every worker.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Spawn the current executable in internal worker mode.
    ///
    /// `args` are the supervisor's own arguments (without argv[0]); the
    /// worker receives them unchanged plus `--internal-worker`, so it resolves
    /// the same configuration.
    pub fn for_current_exe(
        args: Vec<OsString>,
        environment: Environment,
        listen_fd: RawFd,
    ) -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|e| FleetError::Spawn(format!("Failed to get current executable: {}", e)))?;

        let mut args = args;
        args.push(OsString::from("--internal-worker"));

        Ok(Self::new(exe_path, args)
            .with_env(LISTEN_FD_ENV, listen_fd.to_string())
            .with_env(ENVIRONMENT_ENV, environment.as_str()))
    }

    /// Add an environment variable passed to every worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, exits: &UnboundedSender<WorkerExit>) -> Result<WorkerRecord> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        // Workers log to the supervisor's terminal
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| {
            FleetError::Spawn(format!("{}: {}", self.program.display(), e))
        })?;
        let proc = WorkerProc::from_child(child)?;
        let pid = proc.pid();
        let id = WorkerId(pid.as_raw() as u32);

        let exits = exits.clone();
        tokio::spawn(async move {
            let reason = proc.wait().await;
            // The receiver only disappears when the supervisor is shutting down
            let _ = exits.send(WorkerExit { id, reason });
        });

        Ok(WorkerRecord::new(id, Some(pid)))
    }
}

/// Make `listener` survive `exec` so spawned workers inherit it.
pub fn share_listener(listener: &TcpListener) -> Result<RawFd> {
    let fd = listener.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|e| FleetError::Io(std::io::Error::from(e)))?;
    let flags = FdFlag::from_bits_truncate(flags) - FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(|e| FleetError::Io(std::io::Error::from(e)))?;
    Ok(fd)
}

/// Take the listener handed down by the supervisor, if any.
///
/// Returns `Ok(None)` when the process was not started by a supervisor.
pub fn take_inherited_listener() -> Result<Option<TcpListener>> {
    let Ok(raw) = std::env::var(LISTEN_FD_ENV) else {
        return Ok(None);
    };
    let fd: RawFd = raw
        .parse()
        .map_err(|_| FleetError::Config(format!("{} is not a file descriptor: {}", LISTEN_FD_ENV, raw)))?;

    // Safety: the supervisor passes the fd of a bound TcpListener that it
    // cleared FD_CLOEXEC on, and nothing else in this process owns it.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(Some(listener))
}
