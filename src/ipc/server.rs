//! Coordinator side of the IPC channel

use super::{IpcRequest, IpcResponse, MAX_LINE_LENGTH};
use crate::commands::{self, RecorderState};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Accept UI connections until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: RecorderState, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!("IPC listening on {}", addr),
        Err(e) => tracing::warn!("IPC listener has no local address: {}", e),
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept IPC connection: {}", e);
                    continue;
                }
            },
        };
        tracing::debug!("UI attached from {}", peer);

        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_connection(stream, state, shutdown).await;
            tracing::debug!("UI detached from {}", peer);
        });
    }
    tracing::info!("IPC server stopped");
}

async fn handle_connection(stream: TcpStream, state: RecorderState, shutdown: CancellationToken) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = framed.next() => match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::warn!("Dropping IPC connection: {}", e);
                    break;
                }
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => commands::dispatch(&state, request).await,
            Err(e) => IpcResponse::Error {
                code: "PROTOCOL_ERROR".to_string(),
                message: format!("Invalid request: {e}"),
            },
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode IPC response: {}", e);
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            tracing::debug!("UI went away mid-response: {}", e);
            break;
        }
    }
}
