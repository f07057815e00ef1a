// src/runtime/session.rs
//! Runtime session and request handlers
//!
//! One [`RuntimeSession`] exists per worker process. It owns the engine and
//! the processing flag; every handler receives it explicitly.
//!
//! ```text
//! Unstarted ──initialize──▶ Ready ──chat-stream──▶ Processing
//!     │                       ▲                        │
//!     │ bad config            └────── terminal ────────┘
//!     ▼
//!   Error ──initialize (valid)──▶ Ready
//! ```
//!
//! `chat-stream`, `save-tab-memory` and `update-auth-token` run on their
//! own tasks so that `ping` and `get-status` are answered while they are in
//! flight. All replies go through one [`Outbound`] queue, which keeps the
//! per-call order intact.

use crate::engine::config::{AgentConfig, AgentConfigPayload};
use crate::engine::reasoning::{AgentEngine, Outcome, ReasoningEvent};
use crate::protocol::codec::{encode_line, log_message, Direction};
use crate::protocol::events::{ChatOutcome, OutcomeKind, StreamEvent};
use crate::protocol::message::{
    AuthTokenPayload, ChatStreamPayload, ErrorPayload, Message, PingPayload, Reply, Request,
    ResponsePayload, TabMemoryPayload,
};
use crate::runtime::factory::EngineFactory;
use crate::utils::config::EngineSettings;
use crate::utils::errors::RuntimeError;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reply queue shared by the dispatcher and handler tasks
///
/// Replies that would exceed the peer's line limit never reach the writer:
/// an oversized chunk is dropped and an oversized final reply becomes an
/// `error` for the same id, so the caller always sees its call end.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    max_line_bytes: usize,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>, max_line_bytes: usize) -> Self {
        Self { tx, max_line_bytes }
    }

    fn send(&self, id: &str, reply: Reply, quiet: bool) {
        let terminal = !matches!(reply, Reply::Stream(_));
        let mut message = reply.into_message(id);
        if let Err(e) = encode_line(&message, self.max_line_bytes) {
            if !terminal {
                warn!(id, "Dropping stream chunk: {}", e);
                return;
            }
            warn!(id, "Replacing final reply: {}", e);
            let err = RuntimeError::from(e);
            message = Reply::Error(ErrorPayload {
                code: err.code(),
                message: err.to_string(),
            })
            .into_message(id);
        }
        log_message(Direction::Outbound, &message, quiet);
        if self.tx.send(message).is_err() {
            debug!(id, "Outbound channel closed, reply dropped");
        }
    }

    pub fn respond(&self, id: &str, payload: ResponsePayload) {
        self.send(id, Reply::Response(payload), false);
    }

    pub fn stream(&self, id: &str, event: StreamEvent) {
        self.send(id, Reply::Stream(event), false);
    }

    pub fn reject(&self, id: &str, err: &RuntimeError) {
        debug!(id, code = %err.code(), "Rejecting request: {}", err);
        self.send(
            id,
            Reply::Error(ErrorPayload {
                code: err.code(),
                message: err.to_string(),
            }),
            false,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Unstarted,
    Ready,
    /// Setup failed; awaiting a corrected `initialize`
    Error(String),
}

struct SessionInner {
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    config: RwLock<Option<AgentConfig>>,
    engine: RwLock<Option<Arc<AgentEngine>>>,
    auth_token: RwLock<Option<String>>,
    lifecycle: Mutex<Lifecycle>,
    processing: AtomicBool,
}

/// Clears the processing flag when a chat task ends, panics included
struct ProcessingGuard(Arc<SessionInner>);

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.0.processing.store(false, Ordering::SeqCst);
    }
}

/// Per-process agent state
#[derive(Clone)]
pub struct RuntimeSession {
    inner: Arc<SessionInner>,
}

impl RuntimeSession {
    pub fn new(factory: Arc<dyn EngineFactory>, settings: EngineSettings) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                factory,
                settings,
                config: RwLock::new(None),
                engine: RwLock::new(None),
                auth_token: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::Unstarted),
                processing: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.engine.read().is_some()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Route one validated request to its handler
    pub async fn dispatch(&self, id: String, request: Request, out: &Outbound) {
        match request {
            Request::Initialize(payload) => match self.initialize(&payload) {
                Ok(result) => out.respond(&id, ResponsePayload::ok(result)),
                Err(e) => out.reject(&id, &e),
            },
            Request::ChatStream(payload) => {
                if let Err(e) = self.chat_stream(id.clone(), payload, out.clone()) {
                    out.reject(&id, &e);
                }
            }
            Request::GetStatus => out.respond(&id, ResponsePayload::ok(self.status())),
            Request::Reset => {
                let result = self.reset().await;
                out.respond(&id, ResponsePayload::ok(result));
            }
            Request::Ping(payload) => {
                let message = Reply::Response(ResponsePayload::ok(pong(&payload)));
                out.send(&id, message, true);
            }
            Request::SaveTabMemory(page) => match self.engine() {
                Some(engine) => {
                    let out = out.clone();
                    tokio::spawn(async move {
                        out.respond(&id, save_tab_memory(&engine, &page).await);
                    });
                }
                None => out.reject(&id, &RuntimeError::NotInitialized),
            },
            Request::UpdateAuthToken(payload) => {
                let session = self.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let result = session.update_auth_token(payload).await;
                    out.respond(&id, ResponsePayload::ok(result));
                });
            }
        }
    }

    fn engine(&self) -> Option<Arc<AgentEngine>> {
        self.inner.engine.read().clone()
    }

    fn initialize(&self, payload: &AgentConfigPayload) -> Result<Value, RuntimeError> {
        if self.is_initialized() {
            return Err(RuntimeError::AlreadyInitialized);
        }

        let built = AgentConfig::from_payload(payload)
            .map_err(RuntimeError::from)
            .and_then(|mut config| {
                if config.auth_token.is_none() {
                    config.auth_token = self.inner.auth_token.read().clone();
                }
                let engine = self.inner.factory.build(&config, &self.inner.settings)?;
                Ok((config, engine))
            });

        let (config, engine) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!("Agent initialization failed: {}", e);
                *self.inner.lifecycle.lock() = Lifecycle::Error(e.to_string());
                return Err(e);
            }
        };

        info!(
            model = %config.model,
            processor = %config.processor,
            "Agent initialized"
        );
        let result = json!({
            "model": config.model,
            "processor": config.processor.as_str(),
        });

        *self.inner.auth_token.write() = config.auth_token.clone();
        *self.inner.config.write() = Some(config);
        *self.inner.engine.write() = Some(Arc::new(engine));
        *self.inner.lifecycle.lock() = Lifecycle::Ready;
        Ok(result)
    }

    /// Validate and start a chat run; the run itself replies asynchronously
    fn chat_stream(&self, id: String, payload: ChatStreamPayload, out: Outbound) -> Result<(), RuntimeError> {
        let engine = self.engine().ok_or(RuntimeError::NotInitialized)?;

        let message = payload.message.trim();
        if message.is_empty() {
            return Err(RuntimeError::InvalidInput("message must not be empty".to_string()));
        }

        if self
            .inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RuntimeError::Busy);
        }
        let guard = ProcessingGuard(Arc::clone(&self.inner));

        let message = message.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            run_chat(&engine, &id, message, &out).await;
        });
        Ok(())
    }

    /// Current state; never blocks and never mutates
    pub fn status(&self) -> Value {
        let initialized = self.is_initialized();
        let processing = self.is_processing();
        let status = if processing {
            "processing"
        } else if initialized {
            "ready"
        } else {
            "not_initialized"
        };

        let mut result = json!({
            "status": status,
            "initialized": initialized,
            "ready": initialized && !processing,
            "processing": processing,
        });
        if let Some(config) = &*self.inner.config.read() {
            result["model"] = Value::String(config.model.clone());
            result["processor"] = Value::String(config.processor.as_str().to_string());
        }
        if let Lifecycle::Error(reason) = &*self.inner.lifecycle.lock() {
            result["lastError"] = Value::String(reason.clone());
        }
        result
    }

    /// Clear tool-layer caches; keeps the engine and its configuration
    pub async fn reset(&self) -> Value {
        let engine = self.engine();
        if let Some(engine) = &engine {
            engine.tools().reset().await;
        }
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Error(_)) {
                *lifecycle = Lifecycle::Unstarted;
            }
        }
        info!(had_engine = engine.is_some(), "Session reset");
        json!({ "hadEngine": engine.is_some() })
    }

    /// Store the token, then try to hand it to the tool layer
    pub async fn update_auth_token(&self, payload: AuthTokenPayload) -> Value {
        let token = payload.token.filter(|t| !t.trim().is_empty());
        *self.inner.auth_token.write() = token.clone();

        let Some(engine) = self.engine() else {
            debug!("Auth token stored before initialization");
            return json!({ "stored": true, "propagated": false });
        };

        match engine.tools().set_auth_token(token).await {
            Ok(()) => json!({ "stored": true, "propagated": true }),
            Err(e) => {
                error!("Failed to propagate auth token to tool layer: {}", e);
                json!({ "stored": true, "propagated": false, "propagationError": e.to_string() })
            }
        }
    }
}

fn pong(payload: &PingPayload) -> Value {
    json!({
        "pong": true,
        "timestamp": payload.timestamp,
        "receivedAt": chrono::Utc::now().timestamp_millis(),
    })
}

async fn save_tab_memory(engine: &AgentEngine, page: &TabMemoryPayload) -> ResponsePayload {
    match engine.tools().save_tab_memory(page).await {
        Ok(result) => {
            info!(url = %page.url, "Tab saved to memory");
            ResponsePayload::ok(result)
        }
        Err(e) => {
            warn!(url = %page.url, "Failed to save tab to memory: {}", e);
            ResponsePayload::failed(e.to_string(), Value::Null)
        }
    }
}

/// Drive one reasoning run, forwarding every event, then send the terminal response
async fn run_chat(engine: &AgentEngine, id: &str, message: String, out: &Outbound) {
    debug!(id, processor = %engine.processor(), "Chat run started");
    let mut run = engine.start(message);
    let mut outcome = None;

    while let Some(event) = run.next_event().await {
        match event {
            ReasoningEvent::Thought { iteration, text } => {
                out.stream(id, StreamEvent::Thought { content: text, iteration });
            }
            ReasoningEvent::ToolCall { iteration, call } => {
                out.stream(
                    id,
                    StreamEvent::ToolCall {
                        id: call.id,
                        name: call.name,
                        arguments: call.arguments,
                        iteration,
                    },
                );
            }
            ReasoningEvent::Observation { iteration, observation } => {
                out.stream(
                    id,
                    StreamEvent::Observation {
                        id: observation.call_id,
                        name: observation.tool,
                        content: observation.content,
                        is_error: observation.is_error,
                        iteration,
                    },
                );
            }
            ReasoningEvent::Finished { outcome: finished, iterations } => {
                outcome = Some(close_stream(id, finished, iterations, out));
            }
        }
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            let message = "reasoning ended without an outcome";
            out.stream(id, StreamEvent::Error { message: message.to_string() });
            ChatOutcome::failed(message, run.iterations())
        }
    };

    metrics::counter!("agent_chat_outcomes_total", "outcome" => outcome.outcome.as_str()).increment(1);
    info!(
        id,
        outcome = outcome.outcome.as_str(),
        iterations = outcome.iterations,
        "Chat run finished"
    );

    let result = serde_json::to_value(&outcome).unwrap_or(Value::Null);
    let payload = if outcome.success() {
        ResponsePayload::ok(result)
    } else {
        let reason = outcome
            .error
            .clone()
            .unwrap_or_else(|| format!("no response after {} iterations", outcome.iterations));
        ResponsePayload::failed(reason, result)
    };
    out.respond(id, payload);
}

fn close_stream(id: &str, outcome: Outcome, iterations: u32, out: &Outbound) -> ChatOutcome {
    match outcome {
        Outcome::FinalResponse(answer) => {
            out.stream(id, StreamEvent::Chunk { content: answer.clone() });
            out.stream(
                id,
                StreamEvent::Done {
                    outcome: OutcomeKind::FinalResponse,
                    iterations,
                },
            );
            ChatOutcome::final_response(answer, iterations)
        }
        Outcome::IterationLimitReached => {
            out.stream(
                id,
                StreamEvent::Done {
                    outcome: OutcomeKind::IterationLimitReached,
                    iterations,
                },
            );
            ChatOutcome::iteration_limit(iterations)
        }
        Outcome::Failed(failure) => {
            let message = failure.to_string();
            out.stream(id, StreamEvent::Error { message: message.clone() });
            ChatOutcome::failed(message, iterations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FixedEngineFactory, RecordingTools, ScriptedModel};
    use crate::protocol::message::RESPONSE;
    use crate::utils::errors::ErrorCode;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn session_with(model: ScriptedModel, tools: RecordingTools) -> (RuntimeSession, FixedEngineFactory) {
        let factory = FixedEngineFactory::new(model, tools);
        let session = RuntimeSession::new(Arc::new(factory.clone()), EngineSettings::default());
        (session, factory)
    }

    fn outbound() -> (Outbound, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbound::new(tx, 64 * 1024), rx)
    }

    fn init_request() -> Request {
        Request::Initialize(AgentConfigPayload {
            openai_api_key: Some("sk-test".into()),
            ..Default::default()
        })
    }

    fn chat(message: &str) -> Request {
        Request::ChatStream(ChatStreamPayload {
            message: message.into(),
        })
    }

    /// Collect messages for `id` up to and including its terminal reply
    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<Message>, id: &str) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("reply in time")
                .expect("channel open");
            if message.id != id {
                continue;
            }
            let terminal = Reply::from_message(&message).unwrap().is_terminal();
            seen.push(message);
            if terminal {
                return seen;
            }
        }
    }

    fn error_code(message: &Message) -> Option<ErrorCode> {
        match Reply::from_message(message).unwrap() {
            Reply::Error(payload) => Some(payload.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_status_is_idempotent_before_initialize() {
        let (session, _) = session_with(ScriptedModel::new(Vec::<String>::new()), RecordingTools::new());
        let (out, mut rx) = outbound();

        for i in 0..5 {
            let id = format!("s{i}");
            session.dispatch(id.clone(), Request::GetStatus, &out).await;
            let replies = until_terminal(&mut rx, &id).await;
            let data = replies[0].data.clone().unwrap();
            assert_eq!(data["result"]["status"], "not_initialized");
            assert_eq!(data["result"]["ready"], false);
            assert_eq!(data["result"]["initialized"], false);
        }
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_rejects_blank_key_and_recovers() {
        let (session, _) = session_with(ScriptedModel::new(Vec::<String>::new()), RecordingTools::new());
        let (out, mut rx) = outbound();

        let bad = Request::Initialize(AgentConfigPayload {
            openai_api_key: Some("   ".into()),
            model: Some("gpt-4o-mini".into()),
            ..Default::default()
        });
        session.dispatch("i1".into(), bad, &out).await;
        let reply = until_terminal(&mut rx, "i1").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::InvalidConfig));
        let text = reply.data.unwrap()["message"].as_str().unwrap().to_string();
        assert!(text.contains("openaiApiKey"));

        let status = session.status();
        assert_eq!(status["status"], "not_initialized");
        assert!(status["lastError"].is_string());

        session.dispatch("i2".into(), init_request(), &out).await;
        let reply = until_terminal(&mut rx, "i2").await.remove(0);
        assert_eq!(reply.kind, RESPONSE);
        assert!(session.is_initialized());

        session.dispatch("i3".into(), init_request(), &out).await;
        let reply = until_terminal(&mut rx, "i3").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::AlreadyInitialized));
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn test_oversized_answer_ends_call_with_error() {
        let answer = "y".repeat(70 * 1024);
        let (session, _) = session_with(
            ScriptedModel::new([format!("<response>{answer}</response>")]),
            RecordingTools::new(),
        );
        let (out, mut rx) = outbound();

        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("c".into(), chat("long answer please"), &out).await;
        let replies = until_terminal(&mut rx, "c").await;
        let last = replies.last().unwrap();
        assert_eq!(error_code(last), Some(ErrorCode::Internal));
        assert!(last.data.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("exceeds"));
        for reply in &replies {
            assert!(serde_json::to_string(reply).unwrap().len() <= 64 * 1024);
        }
    }

    #[tokio::test]
    async fn test_chat_requires_engine_and_text() {
        let (session, _) = session_with(ScriptedModel::new(Vec::<String>::new()), RecordingTools::new());
        let (out, mut rx) = outbound();

        session.dispatch("c1".into(), chat("hello"), &out).await;
        let reply = until_terminal(&mut rx, "c1").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::NotInitialized));

        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("c2".into(), chat("  \n "), &out).await;
        let reply = until_terminal(&mut rx, "c2").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::InvalidInput));
        assert!(!session.is_processing());
    }

    #[tokio::test]
    async fn test_weather_chat_stream() {
        let model = ScriptedModel::new([
            r#"<thought>check weather</thought><tool_call>{"id": "call_001", "name": "get_weather", "arguments": {"city": "Paris"}}</tool_call>"#,
            "<response>It's 18°C and cloudy in Paris.</response>",
        ]);
        let tools = RecordingTools::new().with_result("get_weather", Ok("18C, cloudy".into()));
        let (session, factory) = session_with(model, tools);
        let (out, mut rx) = outbound();

        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("chat".into(), chat("What's the weather in Paris?"), &out).await;
        let replies = until_terminal(&mut rx, "chat").await;

        let kinds: Vec<String> = replies
            .iter()
            .map(|m| match Reply::from_message(m).unwrap() {
                Reply::Stream(event) => event.type_name().to_string(),
                Reply::Response(_) => "response".to_string(),
                Reply::Error(_) => "error".to_string(),
            })
            .collect();
        assert_eq!(
            kinds,
            ["thought", "tool_call", "observation", "chunk", "done", "response"]
        );

        let Reply::Response(payload) = Reply::from_message(replies.last().unwrap()).unwrap() else {
            panic!("expected response");
        };
        assert!(payload.success);
        let outcome: ChatOutcome = serde_json::from_value(payload.result).unwrap();
        assert_eq!(outcome.outcome, OutcomeKind::FinalResponse);
        assert_eq!(outcome.response.as_deref(), Some("It's 18°C and cloudy in Paris."));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(factory.model.calls(), 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!session.is_processing());
    }

    #[tokio::test]
    async fn test_parse_failure_streams_error_before_response() {
        let (session, _) = session_with(ScriptedModel::new(["no tags here"]), RecordingTools::new());
        let (out, mut rx) = outbound();
        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("chat".into(), chat("hi"), &out).await;
        let replies = until_terminal(&mut rx, "chat").await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            Reply::from_message(&replies[0]).unwrap(),
            Reply::Stream(StreamEvent::Error { .. })
        ));
        let Reply::Response(payload) = Reply::from_message(&replies[1]).unwrap() else {
            panic!("expected response");
        };
        assert!(!payload.success);
        assert_eq!(payload.result["outcome"], "error");
    }

    #[tokio::test]
    async fn test_iteration_limit_is_distinct_outcome() {
        let model = ScriptedModel::new(Vec::<String>::new()).with_fallback("<thought>hmm</thought>");
        let (session, factory) = session_with(model, RecordingTools::new());
        let (out, mut rx) = outbound();
        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("chat".into(), chat("loop forever"), &out).await;
        let replies = until_terminal(&mut rx, "chat").await;
        let done = Reply::from_message(&replies[replies.len() - 2]).unwrap();
        assert_eq!(
            done,
            Reply::Stream(StreamEvent::Done {
                outcome: OutcomeKind::IterationLimitReached,
                iterations: 8
            })
        );
        let Reply::Response(payload) = Reply::from_message(replies.last().unwrap()).unwrap() else {
            panic!("expected response");
        };
        assert!(!payload.success);
        assert_eq!(payload.result["outcome"], "iteration_limit_reached");
        assert_eq!(factory.model.calls(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_chat_is_busy() {
        let gate = Arc::new(Semaphore::new(0));
        let model = ScriptedModel::new(["<response>first</response>", "<response>second</response>"])
            .gated(Arc::clone(&gate));
        let (session, _) = session_with(model, RecordingTools::new());
        let (out, mut rx) = outbound();
        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("a".into(), chat("one"), &out).await;
        session.dispatch("b".into(), chat("two"), &out).await;
        let reply = until_terminal(&mut rx, "b").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::Busy));

        // Status and ping are served while the run is parked
        assert_eq!(session.status()["status"], "processing");
        session
            .dispatch("p".into(), Request::Ping(PingPayload { timestamp: 1000 }), &out)
            .await;
        let pong = until_terminal(&mut rx, "p").await.remove(0);
        assert_eq!(pong.data.unwrap()["result"]["timestamp"], 1000);

        gate.add_permits(1);
        let replies = until_terminal(&mut rx, "a").await;
        assert_eq!(replies.last().unwrap().kind, RESPONSE);
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.add_permits(1);
        session.dispatch("b2".into(), chat("two"), &out).await;
        let replies = until_terminal(&mut rx, "b2").await;
        let Reply::Response(payload) = Reply::from_message(replies.last().unwrap()).unwrap() else {
            panic!("expected response");
        };
        assert!(payload.success);
    }

    #[tokio::test]
    async fn test_null_token_succeeds_when_propagation_fails() {
        let (session, factory) = session_with(
            ScriptedModel::new(Vec::<String>::new()),
            RecordingTools::new().failing_auth(),
        );
        let (out, mut rx) = outbound();
        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        let set = Request::UpdateAuthToken(AuthTokenPayload {
            token: Some("tok-1".into()),
        });
        session.dispatch("t1".into(), set, &out).await;
        until_terminal(&mut rx, "t1").await;

        let clear = Request::UpdateAuthToken(AuthTokenPayload { token: None });
        session.dispatch("t2".into(), clear, &out).await;
        let reply = until_terminal(&mut rx, "t2").await.remove(0);
        let Reply::Response(payload) = Reply::from_message(&reply).unwrap() else {
            panic!("expected response");
        };
        assert!(payload.success);
        assert_eq!(payload.result["propagated"], false);
        assert_eq!(factory.tools.tokens(), vec![Some("tok-1".to_string()), None]);
    }

    #[tokio::test]
    async fn test_reset_and_tab_memory() {
        let (session, factory) = session_with(ScriptedModel::new(Vec::<String>::new()), RecordingTools::new());
        let (out, mut rx) = outbound();

        session.dispatch("r0".into(), Request::Reset, &out).await;
        let reply = until_terminal(&mut rx, "r0").await.remove(0);
        assert_eq!(reply.data.unwrap()["result"]["hadEngine"], false);

        let page = TabMemoryPayload {
            url: "https://example.com".into(),
            title: "Example".into(),
            content: "body".into(),
        };
        session
            .dispatch("m0".into(), Request::SaveTabMemory(page.clone()), &out)
            .await;
        let reply = until_terminal(&mut rx, "m0").await.remove(0);
        assert_eq!(error_code(&reply), Some(ErrorCode::NotInitialized));

        session.dispatch("i".into(), init_request(), &out).await;
        until_terminal(&mut rx, "i").await;

        session.dispatch("m1".into(), Request::SaveTabMemory(page.clone()), &out).await;
        let reply = until_terminal(&mut rx, "m1").await.remove(0);
        assert_eq!(reply.data.unwrap()["success"], true);
        assert_eq!(factory.tools.saved_pages(), vec![page]);

        session.dispatch("r1".into(), Request::Reset, &out).await;
        let reply = until_terminal(&mut rx, "r1").await.remove(0);
        assert_eq!(reply.data.unwrap()["result"]["hadEngine"], true);
        assert_eq!(factory.tools.resets(), 1);
        assert!(session.is_initialized());
    }
}
