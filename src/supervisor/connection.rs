// src/supervisor/connection.rs
//! Request correlation over one worker channel
//!
//! ```text
//!  call() ──insert listener──▶ pending[id] ◀── reader task routes replies
//!     │                                         stream   → listener (+ broadcast)
//!     └──▶ outbound queue ──▶ writer task        response → listener, removed
//!                                                error    → listener, removed
//! ```
//!
//! Every call removes its listener when it returns, on every path. When the
//! worker's output closes, all pending calls fail with `WorkerExited` and
//! the connection's generation is reported on the exit channel.

use crate::protocol::codec::{encode_line, log_message, Direction, MessageCodec};
use crate::protocol::events::StreamEvent;
use crate::protocol::message::{Message, Reply, Request, ResponsePayload};
use crate::supervisor::launcher::{WorkerChannel, WorkerControl};
use crate::supervisor::worker::SupervisorEvent;
use crate::utils::errors::{Result, RuntimeError};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

enum CallUpdate {
    Stream(StreamEvent),
    Done(Result<ResponsePayload>),
}

struct PendingCall {
    tx: mpsc::UnboundedSender<CallUpdate>,
    quiet: bool,
}

type PendingMap = DashMap<String, PendingCall>;

/// Removes a call's listener however the call ends
struct ListenerGuard {
    pending: Arc<PendingMap>,
    id: String,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// One live worker channel
pub struct WorkerConnection {
    generation: u64,
    pid: Option<u32>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    max_line_bytes: usize,
    control: Mutex<Box<dyn WorkerControl>>,
}

impl WorkerConnection {
    /// Start the reader and writer tasks for a launched worker
    pub fn open(
        channel: WorkerChannel,
        generation: u64,
        max_line_bytes: usize,
        exits: mpsc::UnboundedSender<u64>,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        let WorkerChannel {
            reader,
            writer,
            control,
        } = channel;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut sink = FramedWrite::new(writer, MessageCodec::new(max_line_bytes));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match sink.send(message).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        warn!(generation, "Skipping unencodable request: {}", e);
                    }
                    Err(e) => {
                        warn!(generation, "Failed to write to worker: {}", e);
                        return;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let mut frames = FramedRead::new(reader, MessageCodec::new(max_line_bytes));
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Ok(message)) => route(&reader_pending, &events, message),
                    Ok(Err(e)) => warn!(generation, "Dropping malformed message from worker: {}", e),
                    Err(e) => {
                        warn!(generation, "Worker channel read failed: {}", e);
                        break;
                    }
                }
            }

            reader_closed.store(true, Ordering::SeqCst);
            let ids: Vec<String> = reader_pending.iter().map(|entry| entry.key().clone()).collect();
            for id in ids {
                if let Some((_, call)) = reader_pending.remove(&id) {
                    let _ = call.tx.send(CallUpdate::Done(Err(RuntimeError::WorkerExited(
                        "worker closed its channel with the call outstanding".to_string(),
                    ))));
                }
            }
            info!(generation, "Worker channel closed");
            let _ = exits.send(generation);
        });

        let pid = control.pid();
        Self {
            generation,
            pid,
            outbound: parking_lot::Mutex::new(Some(tx)),
            pending,
            closed,
            max_line_bytes,
            control: Mutex::new(control),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Calls awaiting their terminal reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its terminal reply
    pub async fn call(&self, request: Request) -> Result<ResponsePayload> {
        self.call_streaming(request, |_| {}).await
    }

    /// Send a request, handing each `stream` event to `on_event` in order
    pub async fn call_streaming<F>(&self, request: Request, mut on_event: F) -> Result<ResponsePayload>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let id = Message::next_id();
        let quiet = request.kind().is_quiet();
        let message = request.into_message(id.clone());
        // The worker drops lines over the limit unanswered
        encode_line(&message, self.max_line_bytes)?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        self.pending.insert(id.clone(), PendingCall { tx, quiet });
        let _guard = ListenerGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        if self.is_closed() {
            return Err(RuntimeError::WorkerExited("worker channel is closed".to_string()));
        }

        log_message(Direction::Outbound, &message, quiet);
        let sent = match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        };
        if !sent {
            return Err(RuntimeError::WorkerExited("worker input is closed".to_string()));
        }

        while let Some(update) = rx.recv().await {
            match update {
                CallUpdate::Stream(event) => on_event(event),
                CallUpdate::Done(result) => return result,
            }
        }
        Err(RuntimeError::WorkerExited("worker dropped the call".to_string()))
    }

    /// Close the worker's input so it can exit on EOF
    pub fn close_input(&self) {
        self.outbound.lock().take();
    }

    /// Graceful shutdown raced against `timeout`, then a forced kill
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.close_input();
        let mut control = self.control.lock().await;

        if let Err(e) = control.request_shutdown() {
            debug!(generation = self.generation, "Shutdown signal not delivered: {}", e);
        }

        match tokio::time::timeout(timeout, control.wait()).await {
            Ok(Ok(())) => {
                info!(generation = self.generation, "Worker exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(generation = self.generation, "Error waiting for worker: {}", e);
                control.kill().await
            }
            Err(_) => {
                warn!(
                    generation = self.generation,
                    "Worker did not exit within {:?}, forcing kill", timeout
                );
                control.kill().await
            }
        }
    }
}

fn route(pending: &PendingMap, events: &broadcast::Sender<SupervisorEvent>, message: Message) {
    let reply = match Reply::from_message(&message) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(id = %message.id, kind = %message.kind, "Dropping unroutable reply: {}", e);
            return;
        }
    };

    let quiet = pending.get(&message.id).map_or(false, |call| call.quiet);
    log_message(Direction::Inbound, &message, quiet);

    match reply {
        Reply::Stream(event) => {
            match pending.get(&message.id) {
                Some(call) => {
                    let _ = call.tx.send(CallUpdate::Stream(event.clone()));
                }
                None => debug!(id = %message.id, "Stream event for a call nobody awaits"),
            }
            let _ = events.send(SupervisorEvent::StreamChunk {
                call_id: message.id,
                event,
            });
        }
        Reply::Response(payload) => complete(pending, &message.id, Ok(payload)),
        Reply::Error(payload) => complete(
            pending,
            &message.id,
            Err(RuntimeError::Remote {
                code: payload.code,
                message: payload.message,
            }),
        ),
    }
}

fn complete(pending: &PendingMap, id: &str, result: Result<ResponsePayload>) {
    match pending.remove(id) {
        Some((_, call)) => {
            let _ = call.tx.send(CallUpdate::Done(result));
        }
        None => debug!(id, "Terminal reply for a call nobody awaits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FixedEngineFactory, RecordingTools, ScriptedModel};
    use crate::engine::config::AgentConfigPayload;
    use crate::protocol::message::{ChatStreamPayload, PingPayload, ProtocolError};
    use crate::supervisor::launcher::{LocalLauncher, WorkerLauncher};
    use crate::utils::config::EngineSettings;
    use crate::utils::errors::ErrorCode;

    async fn open(model: ScriptedModel) -> (WorkerConnection, mpsc::UnboundedReceiver<u64>) {
        let factory = FixedEngineFactory::new(model, RecordingTools::new());
        let launcher = LocalLauncher::new(Arc::new(factory), EngineSettings::default(), 64 * 1024);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let channel = launcher.launch().await.unwrap();
        (WorkerConnection::open(channel, 7, 64 * 1024, exits_tx, events), exits_rx)
    }

    fn init() -> Request {
        Request::Initialize(AgentConfigPayload {
            openai_api_key: Some("sk-test".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_streaming_call_delivers_events_then_response() {
        let (conn, _exits) = open(ScriptedModel::new([
            "<thought>easy</thought><response>4</response>",
        ]))
        .await;
        assert!(conn.call(init()).await.unwrap().success);

        let mut events = Vec::new();
        let payload = conn
            .call_streaming(
                Request::ChatStream(ChatStreamPayload {
                    message: "2+2?".into(),
                }),
                |event| events.push(event.type_name()),
            )
            .await
            .unwrap();

        assert!(payload.success);
        assert_eq!(events, ["thought", "chunk", "done"]);
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_releases_listener() {
        let (conn, _exits) = open(ScriptedModel::new(Vec::<String>::new())).await;

        let err = conn
            .call(Request::ChatStream(ChatStreamPayload {
                message: "hi".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Remote {
                code: ErrorCode::NotInitialized,
                ..
            }
        ));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_call_releases_listener() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (conn, _exits) = open(ScriptedModel::new(["<response>x</response>"]).gated(gate)).await;
        conn.call(init()).await.unwrap();

        let chat = conn.call(Request::ChatStream(ChatStreamPayload {
            message: "hi".into(),
        }));
        let result = tokio::time::timeout(Duration::from_millis(50), chat).await;
        assert!(result.is_err());
        assert_eq!(conn.pending_calls(), 0);

        let pong = conn
            .call(Request::Ping(PingPayload { timestamp: 5 }))
            .await
            .unwrap();
        assert_eq!(pong.result["pong"], true);
    }

    #[tokio::test]
    async fn test_shutdown_reports_exit_and_fails_new_calls() {
        let (conn, mut exits) = open(ScriptedModel::new(Vec::<String>::new())).await;
        conn.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exits.recv().await, Some(7));
        let err = conn.call(Request::GetStatus).await.unwrap_err();
        assert!(matches!(err, RuntimeError::WorkerExited(_)));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_before_sending() {
        let (conn, _exits) = open(ScriptedModel::new(Vec::<String>::new())).await;
        conn.call(init()).await.unwrap();

        let err = conn
            .call(Request::ChatStream(ChatStreamPayload {
                message: "z".repeat(70 * 1024),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(ProtocolError::Oversized(_))));
        assert_eq!(conn.pending_calls(), 0);

        let status = conn.call(Request::GetStatus).await.unwrap();
        assert_eq!(status.result["ready"], true);
    }

    #[tokio::test]
    async fn test_oversized_reply_ends_call_with_error() {
        let answer = "y".repeat(70 * 1024);
        let (conn, _exits) = open(ScriptedModel::new([format!("<response>{answer}</response>")])).await;
        conn.call(init()).await.unwrap();

        let chat = conn.call(Request::ChatStream(ChatStreamPayload {
            message: "long answer please".into(),
        }));
        let err = tokio::time::timeout(Duration::from_secs(5), chat)
            .await
            .expect("call ends instead of hanging")
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Remote {
                code: ErrorCode::Internal,
                ..
            }
        ));
        assert_eq!(conn.pending_calls(), 0);
    }
}
