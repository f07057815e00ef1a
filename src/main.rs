// src/main.rs
//! Agent Runtime Worker
//!
//! Hosts one agent session and speaks the message protocol over
//! stdin/stdout. Logs go to stderr.

use agent_runtime::observability::{describe_metrics, init_tracing};
use agent_runtime::runtime::{serve, DefaultEngineFactory, RuntimeSession};
use agent_runtime::utils::config::RuntimeSettings;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = RuntimeSettings::load()?;

    // Initialize observability (tracing, metrics, logging)
    init_tracing(&settings.logging)?;
    describe_metrics();

    // A panic leaves the session in an unknown state; exit and let the
    // supervisor restart us
    std::panic::set_hook(Box::new(|panic| {
        error!("Fatal: {}", panic);
        std::process::exit(1);
    }));

    info!(
        "Starting agent runtime worker v{} (pid {})",
        agent_runtime::VERSION,
        std::process::id()
    );

    let session = RuntimeSession::new(Arc::new(DefaultEngineFactory), settings.engine.clone());
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = serve(session, tokio::io::stdin(), tokio::io::stdout(), settings.protocol.max_line_bytes) => {
            match result {
                Ok(()) => info!("Input closed, shutting down"),
                Err(e) => {
                    error!("Serve loop failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    Ok(())
}
