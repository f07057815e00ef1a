// src/runtime/server.rs
//! Read / dispatch / write loop of the worker process
//!
//! ```text
//!  reader ──MessageCodec──▶ validate ──▶ RuntimeSession::dispatch
//!                                              │
//!                               Outbound (mpsc, FIFO)
//!                                              │
//!  writer ◀──MessageCodec── writer task ◀──────┘
//! ```
//!
//! Malformed lines and invalid requests are logged and dropped; they never
//! reach a handler and are never answered.

use crate::protocol::codec::{log_message, Direction, MessageCodec};
use crate::protocol::message::Request;
use crate::runtime::session::{Outbound, RuntimeSession};
use crate::utils::errors::Result;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// How long queued replies may drain after the inbound side closes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve requests until the reader reaches EOF
pub async fn serve<R, W>(
    session: RuntimeSession,
    reader: R,
    writer: W,
    max_line_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sink = FramedWrite::new(writer, MessageCodec::new(max_line_bytes));

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match sink.send(message).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("Skipping unencodable reply: {}", e);
                }
                Err(e) => {
                    error!("Failed to write reply: {}", e);
                    return;
                }
            }
        }
        let _ = sink.close().await;
    });

    let outbound = Outbound::new(tx, max_line_bytes);
    let mut frames = FramedRead::new(reader, MessageCodec::new(max_line_bytes));

    info!("Runtime channel open");
    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                metrics::counter!("agent_protocol_dropped_total").increment(1);
                warn!("Dropping malformed message: {}", e);
                continue;
            }
            Err(e) => {
                error!("Runtime channel read failed: {}", e);
                return Err(e.into());
            }
        };

        let request = match Request::from_message(&message) {
            Ok(request) => request,
            Err(e) => {
                metrics::counter!("agent_protocol_dropped_total").increment(1);
                warn!(id = %message.id, kind = %message.kind, "Dropping invalid request: {}", e);
                continue;
            }
        };

        log_message(Direction::Inbound, &message, request.kind().is_quiet());
        session.dispatch(message.id, request, &outbound).await;
    }

    info!("Runtime channel closed by peer");
    drop(outbound);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        debug!("Reply queue still busy at shutdown");
    }
    Ok(())
}
