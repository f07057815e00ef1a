// src/lib.rs
//! Agent Runtime Library
//!
//! This library runs a tool-calling AI agent in an isolated worker process
//! and supervises that process from the host application.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **protocol**: Message envelope, request/reply variants, NDJSON framing
//! - **engine**: ReAct/CoAct reasoning loop, model client and tool layer
//! - **runtime**: Worker-side session, dispatch and serve loop
//! - **supervisor**: Host-side lifecycle, health checks and restarts
//! - **observability**: Tracing subscriber and metric descriptions
//! - **utils**: Errors and layered settings

pub mod engine;
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types
pub use engine::config::{AgentConfig, ProcessorKind};
pub use protocol::events::{ChatOutcome, OutcomeKind, StreamEvent};
pub use runtime::session::RuntimeSession;
pub use supervisor::worker::{SupervisorEvent, SupervisorStatus, WorkerSupervisor};
pub use utils::config::RuntimeSettings;
pub use utils::errors::{Result, RuntimeError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
