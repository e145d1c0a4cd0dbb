//! Persisted orchestrator records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Subscription tier of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadSessionStatus {
    Uploading,
    Completed,
    Failed,
    Expired,
}

impl UploadSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadSessionStatus::Uploading => "uploading",
            UploadSessionStatus::Completed => "completed",
            UploadSessionStatus::Failed => "failed",
            UploadSessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for UploadSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadSessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(UploadSessionStatus::Uploading),
            "completed" => Ok(UploadSessionStatus::Completed),
            "failed" => Ok(UploadSessionStatus::Failed),
            "expired" => Ok(UploadSessionStatus::Expired),
            other => Err(format!("unknown upload session status: {other}")),
        }
    }
}

/// A storage multipart session, one per recording. Only ever moves forward
/// out of `uploading`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub owner_id: String,
    pub provider_upload_id: String,
    pub object_key: String,
    pub status: UploadSessionStatus,
    pub parts_uploaded: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A published recording, created only at completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Same id as the session's `recording_id`
    pub id: Uuid,
    pub owner_id: String,
    pub title: Option<String>,
    pub duration_seconds: f64,
    pub object_key: String,
    pub byte_size: i64,
    pub share_token: String,
    pub is_public: bool,
    pub view_count: i64,
    pub created_at: DateTime<Utc>,
    /// `None` for the paid tier
    pub expires_at: Option<DateTime<Utc>>,
}

impl Recording {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Storage key of a recording's object
pub fn object_key(owner_id: &str, recording_id: Uuid) -> String {
    format!("recordings/{owner_id}/{recording_id}.webm")
}
