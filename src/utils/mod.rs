// src/utils/mod.rs
//! Shared utilities: crate error type and layered settings

pub mod config;
pub mod errors;

pub use config::RuntimeSettings;
pub use errors::{ErrorCode, Result, RuntimeError};
