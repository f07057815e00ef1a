// src/protocol/mod.rs
//! Supervisor <-> runtime process message protocol
//!
//! - **Message**: `{id, type, data}` envelope, the closed set of seven
//!   request kinds, and the three reply kinds (`response`, `stream`, `error`)
//! - **Events**: stream event sub-types and the terminal chat outcome
//! - **Codec**: newline-delimited JSON framing with per-line validation
//!
//! # Correlation
//!
//! ```text
//! Supervisor                          Runtime process
//!    │  {id: A, type: chat-stream} ──▶   │
//!    │  {id: B, type: ping}        ──▶   │
//!    │  ◀── {id: B, type: response}      │   pong overtakes the chat
//!    │  ◀── {id: A, type: stream} ...    │
//!    │  ◀── {id: A, type: response}      │   always last for A
//! ```

pub mod codec;
pub mod events;
pub mod message;

pub use codec::{log_message, parse_message, Direction, MessageCodec};
pub use events::{ChatOutcome, OutcomeKind, StreamEvent};
pub use message::{
    AuthTokenPayload, ChatStreamPayload, ErrorPayload, Message, PingPayload, ProtocolError,
    Reply, Request, RequestKind, ResponsePayload, TabMemoryPayload,
};
