// src/utils/config.rs
//! Layered runtime settings
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults ([`RuntimeSettings::default`])
//! 2. An optional settings file (TOML, YAML or JSON, by extension)
//! 3. Environment variables prefixed with `AGENT_RUNTIME_`, nested keys
//!    separated by `__` (e.g. `AGENT_RUNTIME_SUPERVISOR__MAX_RESTARTS=3`)
//!
//! Per-session agent configuration (model, credentials) is not a setting;
//! it arrives with each `initialize` call.

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "AGENT_RUNTIME";

/// Environment variable naming an optional settings file
pub const SETTINGS_FILE_ENV: &str = "AGENT_RUNTIME_SETTINGS";

/// Root settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub engine: EngineSettings,
    pub supervisor: SupervisorSettings,
    pub worker: WorkerSettings,
    pub protocol: ProtocolSettings,
    pub logging: LoggingSettings,
}

/// Reasoning loop limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model invocations allowed per `chat-stream`
    pub max_iterations: u32,

    /// Tool calls executed per iteration by the CoAct processor
    pub coact_max_tool_calls: usize,

    /// Observations longer than this are truncated before entering the transcript
    pub max_observation_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            coact_max_tool_calls: 4,
            max_observation_chars: 8_000,
        }
    }
}

/// Health and restart policy for the worker supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub health_check_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub max_restarts: u32,
    pub stale_after_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub restart_backoff_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            ping_timeout_secs: 5,
            max_consecutive_failures: 3,
            max_restarts: 2,
            stale_after_secs: 120,
            shutdown_timeout_secs: 10,
            restart_backoff_ms: 500,
        }
    }
}

impl SupervisorSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// How the supervisor launches the worker binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker executable; defaults to `agent-runtime-worker`
    /// next to the current executable
    pub program: Option<PathBuf>,

    pub args: Vec<String>,

    pub env: HashMap<String, String>,

    pub work_dir: Option<PathBuf>,
}

/// Wire framing limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub max_line_bytes: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RuntimeSettings {
    /// Load settings from defaults, `$AGENT_RUNTIME_SETTINGS` (if set) and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(SETTINGS_FILE_ENV).map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Load settings with an explicit settings file
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }
}
