// src/supervisor/launcher.rs
//! Worker launchers
//!
//! A launch yields a [`WorkerChannel`]: the byte streams the protocol runs
//! over plus a [`WorkerControl`] for shutdown. Two launchers ship:
//!
//! - [`ProcessLauncher`]: the worker binary as an OS process (stdin/stdout)
//! - [`LocalLauncher`]: a [`RuntimeSession`] on a task behind an in-memory
//!   duplex, for embedding and tests

use crate::runtime::factory::EngineFactory;
use crate::runtime::server::serve;
use crate::runtime::session::RuntimeSession;
use crate::supervisor::process_manager::ProcessManager;
use crate::utils::config::{EngineSettings, WorkerSettings};
use crate::utils::errors::{Result, RuntimeError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const LOCAL_BUFFER_BYTES: usize = 256 * 1024;

/// Lifecycle handle of a launched worker
#[async_trait]
pub trait WorkerControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to exit on its own
    fn request_shutdown(&mut self) -> Result<()>;

    /// Wait until the worker has exited
    async fn wait(&mut self) -> Result<()>;

    /// Stop the worker immediately
    async fn kill(&mut self) -> Result<()>;
}

/// A launched worker's protocol streams and control handle
pub struct WorkerChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub control: Box<dyn WorkerControl>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerChannel>;
}

/// Launches the worker binary
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    manager: ProcessManager,
}

impl ProcessLauncher {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            manager: ProcessManager::new(settings),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerChannel> {
        let mut child = self.manager.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::ProcessSpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::ProcessSpawnFailed("failed to capture stdout".into()))?;

        Ok(WorkerChannel {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ProcessControl { child }),
        })
    }
}

struct ProcessControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn request_shutdown(&mut self) -> Result<()> {
        match self.child.id() {
            Some(pid) => ProcessManager::terminate(pid),
            None => Ok(()),
        }
    }

    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        debug!("Worker process exited with status: {}", status);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        // No pid means the child was already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        warn!("Killing worker process {}", pid);
        ProcessManager::force_kill(pid)?;
        let status = self.child.wait().await?;
        debug!("Killed worker process exited with status: {}", status);
        Ok(())
    }
}

/// Runs a runtime session in-process
#[derive(Clone)]
pub struct LocalLauncher {
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    max_line_bytes: usize,
}

impl LocalLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>, settings: EngineSettings, max_line_bytes: usize) -> Self {
        Self {
            factory,
            settings,
            max_line_bytes,
        }
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self) -> Result<WorkerChannel> {
        let session = RuntimeSession::new(Arc::clone(&self.factory), self.settings.clone());
        let (supervisor_side, worker_side) = tokio::io::duplex(LOCAL_BUFFER_BYTES);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (reader, writer) = tokio::io::split(supervisor_side);

        let handle = tokio::spawn(serve(session, worker_read, worker_write, self.max_line_bytes));

        Ok(WorkerChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(TaskControl {
                handle: Some(handle),
            }),
        })
    }
}

struct TaskControl {
    handle: Option<JoinHandle<Result<()>>>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn request_shutdown(&mut self) -> Result<()> {
        // The session stops once its input closes
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            match handle.await {
                Ok(result) => result?,
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(RuntimeError::Internal(format!("local worker panicked: {e}"))),
            }
            self.handle = None;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }
}
