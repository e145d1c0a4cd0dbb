//! UI <-> coordinator message channel
//!
//! One JSON object per line over a local TCP socket. The UI is transient: it
//! connects, sends requests, and rebuilds its view from `status` answers.

pub mod client;
pub mod server;

pub use client::IpcClient;
pub use server::serve;

use crate::recorder::{RecordingConfig, StatusSnapshot, StoredArtifact};
use serde::{Deserialize, Serialize};

/// Longest accepted request or response line
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcRequest {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<RecordingConfig>,
    },
    Pause,
    Resume,
    Stop,
    Status,
    RetryUpload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpcResponse {
    Ok,
    Status { snapshot: StatusSnapshot },
    Stopped { artifact: StoredArtifact },
    Error { code: String, message: String },
}
