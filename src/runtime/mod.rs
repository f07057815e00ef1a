// src/runtime/mod.rs
//! Runtime process entrypoint
//!
//! The worker process hosts exactly one [`RuntimeSession`] and speaks the
//! message protocol over a pair of byte streams (stdin/stdout in the
//! worker binary, an in-memory duplex in tests and local launches).
//!
//! - **Session**: engine ownership, processing exclusion, request handlers
//! - **Server**: framing, validation and the single reply queue
//! - **Factory**: engine construction from a validated `AgentConfig`

pub mod factory;
pub mod server;
pub mod session;

pub use factory::{DefaultEngineFactory, EngineFactory};
pub use server::serve;
pub use session::{Outbound, RuntimeSession};
