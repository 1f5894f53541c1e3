//! Process handle for worker subprocesses.

use super::signals::{TerminationReason, analyze_exit_status};
use crate::error::{FleetError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;

/// Handle to a running worker subprocess.
///
/// The handle is consumed by [`WorkerProc::wait`], which runs on its own task;
/// anything that needs to signal the worker afterwards goes through the pid.
pub struct WorkerProc {
    pid: Pid,
    child: Child,
}

impl WorkerProc {
    /// Wrap a freshly spawned child.
    ///
    /// Fails if the child already exited and was reaped before we could read
    /// its pid.
    pub fn from_child(child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| FleetError::Worker("Child exited before its pid was read".into()))?;
        Ok(Self {
            pid: Pid::from_raw(pid as i32),
            child,
        })
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the process to exit and classify why it did.
    pub async fn wait(mut self) -> TerminationReason {
        match self.child.wait().await {
            Ok(status) => analyze_exit_status(status),
            Err(e) => {
                tracing::error!(pid = %self.pid, error = %e, "Failed to collect worker exit status");
                TerminationReason::Unknown
            }
        }
    }
}

/// Send SIGTERM to a worker.
pub fn terminate(pid: Pid) -> Result<()> {
    signal::kill(pid, Signal::SIGTERM)
        .map_err(|e| FleetError::Worker(format!("Failed to send SIGTERM to {}: {}", pid, e)))
}
