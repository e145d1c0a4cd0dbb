//! IPC command handlers
//!
//! Maps each request arriving on the coordinator's IPC channel to its handler.

pub mod recording;

pub use recording::RecorderState;

use crate::ipc::{IpcRequest, IpcResponse};

/// Run one request against the coordinator
pub async fn dispatch(state: &RecorderState, request: IpcRequest) -> IpcResponse {
    tracing::debug!("IPC request: {:?}", request);
    let result = match request {
        IpcRequest::Start { config } => recording::start_recording(state, config)
            .await
            .map(|snapshot| IpcResponse::Status { snapshot }),
        IpcRequest::Pause => recording::pause_recording(state)
            .await
            .map(|_| IpcResponse::Ok),
        IpcRequest::Resume => recording::resume_recording(state)
            .await
            .map(|_| IpcResponse::Ok),
        IpcRequest::Stop => recording::stop_recording(state)
            .await
            .map(|artifact| IpcResponse::Stopped { artifact }),
        IpcRequest::Status => Ok(IpcResponse::Status {
            snapshot: recording::get_recording_status(state),
        }),
        IpcRequest::RetryUpload => recording::retry_upload(state).await.map(|_| IpcResponse::Ok),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!("IPC request failed: {} ({})", e.message, e.code);
        IpcResponse::Error {
            code: e.code,
            message: e.message,
        }
    })
}
