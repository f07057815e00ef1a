// src/observability/mod.rs
//! Logging and metrics setup
//!
//! The worker's stdout carries the protocol, so every log line goes to
//! stderr. Metrics are recorded through the `metrics` facade; installing a
//! recorder is up to the embedding host.

use crate::utils::config::LoggingSettings;
use crate::utils::errors::{Result, RuntimeError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&settings.level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    installed.map_err(|e| RuntimeError::Internal(format!("failed to install tracing subscriber: {e}")))
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| RuntimeError::Internal(format!("invalid log filter {:?}: {e}", level)))
}

/// Describe every metric this crate records
pub fn describe_metrics() {
    metrics::describe_counter!(
        "agent_model_invocations_total",
        "Model invocations made by the reasoning loop"
    );
    metrics::describe_counter!(
        "agent_tool_calls_total",
        "Tool calls executed, labelled by status"
    );
    metrics::describe_counter!(
        "agent_chat_outcomes_total",
        "Completed chat-stream calls, labelled by outcome"
    );
    metrics::describe_counter!(
        "agent_protocol_dropped_total",
        "Inbound messages dropped as malformed or invalid"
    );
    metrics::describe_counter!(
        "agent_worker_restarts_total",
        "Automatic worker restart attempts"
    );
    metrics::describe_counter!(
        "agent_health_check_failures_total",
        "Failed or timed out worker ping probes"
    );
}
