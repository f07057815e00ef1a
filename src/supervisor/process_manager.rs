// src/supervisor/process_manager.rs
//! Process manager for the worker binary
//!
//! Spawns `agent-runtime-worker` with piped stdin/stdout (the protocol
//! channel) and inherited stderr (its logs), and signals it on shutdown:
//! - SIGTERM to request a graceful exit
//! - SIGKILL once the grace period is over

use crate::utils::config::WorkerSettings;
use crate::utils::errors::{Result, RuntimeError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Worker binary name
pub const WORKER_BINARY: &str = "agent-runtime-worker";

/// Spawns and signals worker processes
#[derive(Debug, Clone, Default)]
pub struct ProcessManager {
    settings: WorkerSettings,
}

impl ProcessManager {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    /// Configured program, or the worker binary next to the current executable
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.settings.program {
            return Ok(program.clone());
        }

        let current = std::env::current_exe().map_err(|e| {
            RuntimeError::ProcessSpawnFailed(format!("cannot locate current executable: {e}"))
        })?;
        let dir = current.parent().ok_or_else(|| {
            RuntimeError::ProcessSpawnFailed("current executable has no parent directory".into())
        })?;

        Ok(dir.join(format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX)))
    }

    /// Spawn a worker; the child is killed if its handle is dropped
    pub fn spawn(&self) -> Result<Child> {
        let program = self.resolve_program()?;
        debug!("Spawning worker process: {:?}", program);

        let mut command = Command::new(&program);
        command.args(&self.settings.args);

        if let Some(work_dir) = &self.settings.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &self.settings.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            RuntimeError::ProcessSpawnFailed(format!("failed to spawn {:?}: {}", program, e))
        })?;

        info!("Worker process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Ask a process to exit
    pub fn terminate(pid: u32) -> Result<()> {
        let pid = Pid::from_raw(pid as i32);
        debug!("Sending SIGTERM to PID {}", pid);
        kill(pid, Signal::SIGTERM)
            .map_err(|e| RuntimeError::Internal(format!("failed to send SIGTERM: {e}")))
    }

    /// Kill a process outright
    pub fn force_kill(pid: u32) -> Result<()> {
        let pid = Pid::from_raw(pid as i32);
        debug!("Sending SIGKILL to PID {}", pid);
        kill(pid, Signal::SIGKILL)
            .map_err(|e| RuntimeError::Internal(format!("failed to send SIGKILL: {e}")))
    }

    /// Check if a process is running
    pub fn is_running(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}
