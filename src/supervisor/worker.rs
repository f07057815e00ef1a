// src/supervisor/worker.rs
//! Worker supervisor
//!
//! Owns zero or one live worker at a time. Caller intent becomes protocol
//! requests on the live connection; a background monitor reacts to worker
//! exits and runs the periodic ping probe.
//!
//! ```text
//!               initialize()                 exit (unexpected)
//!  Unstarted ───────────────▶ Connected ─────────────────────▶ Restarting
//!      ▲                        │   ▲                              │
//!      │ terminate()            │   └──────── restart ok ──────────┤
//!      └────────────────────────┘                                  │ restarts > max
//!                                                                  ▼
//!                                                     Failed (until initialize
//!                                                      or clear_failure)
//! ```

use crate::engine::config::AgentConfig;
use crate::protocol::events::{ChatOutcome, StreamEvent};
use crate::protocol::message::{
    AuthTokenPayload, ChatStreamPayload, PingPayload, Request, ResponsePayload, TabMemoryPayload,
};
use crate::supervisor::connection::WorkerConnection;
use crate::supervisor::health::WorkerHealth;
use crate::supervisor::launcher::{ProcessLauncher, WorkerLauncher};
use crate::utils::config::{RuntimeSettings, SupervisorSettings};
use crate::utils::errors::{ErrorCode, Result, RuntimeError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 256;
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle notifications, delivered through [`WorkerSupervisor::subscribe`]
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Connected { generation: u64, pid: Option<u32> },
    Disconnected { generation: u64, reason: String },
    Unhealthy { reason: String },
    Restarted { generation: u64, restart_count: u32 },
    StreamChunk { call_id: String, event: StreamEvent },
    Error { message: String },
}

/// Snapshot returned by [`WorkerSupervisor::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub initialized: bool,
    pub ready: bool,
    pub processing: bool,
    pub is_healthy: bool,

    /// Durable failure that blocks new work until cleared
    pub failure: Option<String>,

    pub health: WorkerHealth,
}

#[derive(Debug, Clone)]
struct Failure {
    restarts: u32,
    reason: String,
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorSettings,
    max_line_bytes: usize,
    health: Mutex<WorkerHealth>,
    connection: RwLock<Option<Arc<WorkerConnection>>>,
    config: RwLock<Option<AgentConfig>>,

    /// Latest `update_auth_token` value, replayed into restarted workers
    auth_token: RwLock<Option<Option<String>>>,

    terminating: AtomicBool,
    failure: Mutex<Option<Failure>>,
    events: broadcast::Sender<SupervisorEvent>,
    generation: AtomicU64,
    monitor: Mutex<Option<Monitor>>,

    /// Serializes initialize and terminate
    ops: tokio::sync::Mutex<()>,
}

/// Host-side owner of the agent runtime worker
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, settings: &RuntimeSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                settings: settings.supervisor.clone(),
                max_line_bytes: settings.protocol.max_line_bytes,
                health: Mutex::new(WorkerHealth::default()),
                connection: RwLock::new(None),
                config: RwLock::new(None),
                auth_token: RwLock::new(None),
                terminating: AtomicBool::new(false),
                failure: Mutex::new(None),
                events,
                generation: AtomicU64::new(0),
                monitor: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Supervise the `agent-runtime-worker` binary
    pub fn with_process_launcher(settings: &RuntimeSettings) -> Self {
        Self::new(Arc::new(ProcessLauncher::new(settings.worker.clone())), settings)
    }

    /// Spawn a worker and initialize its engine with `config`
    ///
    /// The config is validated before anything is spawned. A worker that
    /// fails during startup is shut down before the error is returned.
    pub async fn initialize(&self, config: AgentConfig) -> Result<()> {
        config.validate()?;

        let inner = &self.inner;
        let _ops = inner.ops.lock().await;

        let restarting = inner.health.lock().is_restarting;
        if restarting || inner.connection.read().is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }

        inner.stop_monitor().await;
        *inner.failure.lock() = None;
        *inner.health.lock() = WorkerHealth::default();
        *inner.config.write() = Some(config);

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        if let Err(e) = inner.start_worker(&exits_tx).await {
            error!("Failed to initialize worker: {}", e);
            *inner.config.write() = None;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            exits_rx,
            exits_tx,
        ));
        *inner.monitor.lock() = Some(Monitor { cancel, handle });

        Ok(())
    }

    /// Run one `chat-stream` call, handing each stream event to `on_event`
    ///
    /// A failed run still returns `Ok`; inspect [`ChatOutcome::outcome`].
    pub async fn send_message<F>(&self, text: &str, on_event: F) -> Result<ChatOutcome>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let request = Request::ChatStream(ChatStreamPayload {
            message: text.to_string(),
        });
        let payload = self.send_streaming_request(request, on_event).await?;
        Ok(serde_json::from_value(payload.result)?)
    }

    pub async fn send_request(&self, request: Request) -> Result<ResponsePayload> {
        let connection = self.inner.live_connection()?;
        connection.call(request).await
    }

    /// The listener is released when the call ends, on every path
    pub async fn send_streaming_request<F>(&self, request: Request, on_event: F) -> Result<ResponsePayload>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let connection = self.inner.live_connection()?;
        connection.call_streaming(request, on_event).await
    }

    /// Clear the engine's caches; returns whether an engine existed
    pub async fn reset(&self) -> Result<bool> {
        let payload = self.send_request(Request::Reset).await?;
        Ok(payload.result["hadEngine"].as_bool().unwrap_or(false))
    }

    /// Store a new tool-server token and forward it to the live worker
    pub async fn update_auth_token(&self, token: Option<String>) -> Result<ResponsePayload> {
        *self.inner.auth_token.write() = Some(token.clone());
        self.send_request(Request::UpdateAuthToken(AuthTokenPayload { token }))
            .await
    }

    pub async fn save_tab_memory(&self, page: TabMemoryPayload) -> Result<ResponsePayload> {
        self.send_request(Request::SaveTabMemory(page)).await
    }

    /// Current lifecycle and health; never blocks behind a chat call
    pub async fn get_status(&self) -> SupervisorStatus {
        let inner = &self.inner;
        let connection = inner.connection.read().clone();

        let remote = match connection {
            Some(connection) => {
                let call = connection.call(Request::GetStatus);
                match tokio::time::timeout(inner.settings.ping_timeout(), call).await {
                    Ok(Ok(payload)) => Some(payload.result),
                    Ok(Err(e)) => {
                        debug!("Status query failed: {}", e);
                        None
                    }
                    Err(_) => {
                        debug!("Status query timed out");
                        None
                    }
                }
            }
            None => None,
        };

        let flag = |key: &str| {
            remote
                .as_ref()
                .and_then(|status| status[key].as_bool())
                .unwrap_or(false)
        };

        let health = inner.health.lock().clone();
        let failure = inner.failure.lock().as_ref().map(|f| f.reason.clone());
        SupervisorStatus {
            initialized: flag("initialized"),
            ready: flag("ready"),
            processing: flag("processing"),
            is_healthy: failure.is_none() && health.is_healthy(&inner.settings, Instant::now()),
            failure,
            health,
        }
    }

    /// Stop the worker and clear all state
    ///
    /// Graceful shutdown races the configured timeout, then the worker is
    /// killed. State is cleared whichever way the shutdown went.
    pub async fn terminate(&self) -> Result<()> {
        let inner = &self.inner;
        let _ops = inner.ops.lock().await;

        inner.terminating.store(true, Ordering::SeqCst);
        inner.stop_monitor().await;

        let connection = inner.connection.write().take();
        let result = match connection {
            Some(connection) => {
                info!(generation = connection.generation(), "Terminating worker");
                let result = connection
                    .shutdown(inner.settings.shutdown_timeout())
                    .await;
                inner.emit(SupervisorEvent::Disconnected {
                    generation: connection.generation(),
                    reason: "terminated".to_string(),
                });
                result
            }
            None => Ok(()),
        };

        *inner.health.lock() = WorkerHealth::default();
        *inner.config.write() = None;
        *inner.auth_token.write() = None;
        *inner.failure.lock() = None;
        inner.terminating.store(false, Ordering::SeqCst);

        result
    }

    pub fn health(&self) -> WorkerHealth {
        self.inner.health.lock().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.failure.lock().is_none()
            && self
                .inner
                .health
                .lock()
                .is_healthy(&self.inner.settings, Instant::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Acknowledge a durable failure and reset the restart counter
    pub fn clear_failure(&self) {
        if self.inner.failure.lock().take().is_some() {
            info!("Worker failure cleared");
        }
        self.inner.health.lock().restart_count = 0;
    }
}

impl Inner {
    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn live_connection(&self) -> Result<Arc<WorkerConnection>> {
        let failure = self.failure.lock().clone();
        if let Some(failure) = failure {
            return Err(RuntimeError::RestartLimitExceeded {
                restarts: failure.restarts,
                reason: failure.reason,
            });
        }

        let connection = self.connection.read().clone();
        let Some(connection) = connection else {
            let restarting = self.health.lock().is_restarting;
            return Err(if restarting {
                RuntimeError::Unhealthy("worker is restarting".to_string())
            } else {
                RuntimeError::NotInitialized
            });
        };

        self.health
            .lock()
            .assess(&self.settings, Instant::now())
            .map_err(RuntimeError::Unhealthy)?;

        Ok(connection)
    }

    /// Launch a worker, send `initialize`, and install it as the live connection
    async fn start_worker(&self, exits: &mpsc::UnboundedSender<u64>) -> Result<Arc<WorkerConnection>> {
        let config = self.config.read().clone().ok_or(RuntimeError::NotInitialized)?;
        let mut payload = config.to_payload();
        let token = self.auth_token.read().clone();
        if let Some(token) = token {
            payload.auth_token = token;
        }

        let channel = self.launcher.launch().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(WorkerConnection::open(
            channel,
            generation,
            self.max_line_bytes,
            exits.clone(),
            self.events.clone(),
        ));

        let outcome = match connection.call(Request::Initialize(payload)).await {
            Ok(response) if response.success => Ok(()),
            Ok(response) => Err(RuntimeError::Remote {
                code: ErrorCode::Internal,
                message: response
                    .error
                    .unwrap_or_else(|| "initialize was not acknowledged".to_string()),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if let Err(shutdown_err) = connection.shutdown(self.settings.shutdown_timeout()).await {
                warn!(generation, "Failed to stop partially started worker: {}", shutdown_err);
            }
            return Err(e);
        }

        *self.connection.write() = Some(Arc::clone(&connection));
        self.health.lock().mark_connected(Instant::now());

        info!(generation, pid = ?connection.pid(), "Worker connected");
        self.emit(SupervisorEvent::Connected {
            generation,
            pid: connection.pid(),
        });

        Ok(connection)
    }

    /// Returns false once monitoring should stop
    async fn handle_exit(
        &self,
        generation: u64,
        exits: &mpsc::UnboundedSender<u64>,
        cancel: &CancellationToken,
    ) -> bool {
        if self.terminating.load(Ordering::SeqCst) {
            return true;
        }

        {
            let mut connection = self.connection.write();
            let current = connection.as_ref().map(|c| c.generation());
            if current != Some(generation) {
                debug!(generation, "Ignoring exit of a retired worker");
                return true;
            }
            connection.take();

            let mut health = self.health.lock();
            health.mark_disconnected();
            health.is_restarting = true;
        }

        warn!(generation, "Worker exited unexpectedly");
        self.emit(SupervisorEvent::Disconnected {
            generation,
            reason: "worker exited unexpectedly".to_string(),
        });

        loop {
            let restart_count = {
                let mut health = self.health.lock();
                health.restart_count += 1;
                health.restart_count
            };
            metrics::counter!("agent_worker_restarts_total").increment(1);

            if restart_count > self.settings.max_restarts {
                let failure = Failure {
                    restarts: restart_count - 1,
                    reason: format!(
                        "worker kept exiting; restart limit of {} reached",
                        self.settings.max_restarts
                    ),
                };
                error!(restarts = failure.restarts, "{}", failure.reason);
                self.health.lock().is_restarting = false;
                self.emit(SupervisorEvent::Error {
                    message: failure.reason.clone(),
                });
                *self.failure.lock() = Some(failure);
                return false;
            }

            let delay = self.restart_delay(restart_count);
            warn!(restart_count, "Restarting worker in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.health.lock().is_restarting = false;
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.start_worker(exits).await {
                Ok(connection) => {
                    self.emit(SupervisorEvent::Restarted {
                        generation: connection.generation(),
                        restart_count,
                    });
                    return true;
                }
                Err(e) => warn!(restart_count, "Restart attempt failed: {}", e),
            }
        }
    }

    /// Exponential backoff with jitter
    fn restart_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.restart_backoff();
        let scaled = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        scaled + Duration::from_millis(jitter)
    }

    async fn probe(&self) {
        let connection = self.connection.read().clone();
        let Some(connection) = connection else {
            return;
        };

        let ping = Request::Ping(PingPayload {
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        let timeout = self.settings.ping_timeout();

        let reason = match tokio::time::timeout(timeout, connection.call(ping)).await {
            Ok(Ok(pong)) if pong.success => {
                self.health.lock().record_success(Instant::now());
                trace!(generation = connection.generation(), "Health check passed");
                return;
            }
            Ok(Ok(_)) => "ping was not acknowledged".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no pong within {:?}", timeout),
        };

        let failures = self.health.lock().record_failure();
        metrics::counter!("agent_health_check_failures_total").increment(1);
        warn!(failures, "Health check failed: {}", reason);

        if failures == self.settings.max_consecutive_failures {
            self.emit(SupervisorEvent::Unhealthy {
                reason: format!("{} consecutive health checks failed: {}", failures, reason),
            });
        }
    }

    async fn stop_monitor(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            monitor.handle.abort();
            let _ = monitor.handle.await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.cancel.cancel();
            monitor.handle.abort();
        }
    }
}

async fn monitor(
    inner: Weak<Inner>,
    cancel: CancellationToken,
    mut exits: mpsc::UnboundedReceiver<u64>,
    exits_tx: mpsc::UnboundedSender<u64>,
) {
    let period = match inner.upgrade() {
        Some(inner) => inner.settings.health_check_interval().max(MIN_PROBE_INTERVAL),
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("Worker monitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(generation) = exits.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                if !inner.handle_exit(generation, &exits_tx, &cancel).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.probe().await;
            }
        }
    }
    debug!("Worker monitor stopped");
}
