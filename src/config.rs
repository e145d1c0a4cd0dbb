//! Configuration
//!
//! Both binaries read an optional TOML file layered under environment
//! variables: `SCREENLINK__SECTION__KEY` for the daemon and
//! `SCREENLINK_SERVER__SECTION__KEY` for the server.

use crate::recorder::{ControllerSettings, CoordinatorSettings, RecordingConfig};
use crate::upload::UploadSettings;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn load<T: serde::de::DeserializeOwned>(prefix: &str, config_file: Option<&Path>) -> Result<T, ConfigError> {
    let mut builder = ConfigBuilder::builder();

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "screenlink=debug".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub addr: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:47700".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Real devices through FFmpeg
    Ffmpeg,
    /// Test patterns, for dry runs
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    pub ffmpeg_path: String,
    pub display: Option<String>,
    pub frame_rate: u32,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub webcam_enabled: bool,
    pub webcam_device: Option<String>,
    pub microphone_enabled: bool,
    pub microphone_device: Option<String>,
    pub system_audio_enabled: bool,
    pub system_audio_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            display: None,
            frame_rate: 30,
            screen_width: None,
            screen_height: None,
            webcam_enabled: false,
            webcam_device: None,
            microphone_enabled: true,
            microphone_device: None,
            system_audio_enabled: true,
            system_audio_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSection {
    pub max_duration_secs: u64,
    pub timeslice_ms: u64,
    pub flush_timeout_ms: u64,
    pub artifact_dir: PathBuf,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            max_duration_secs: 420,
            timeslice_ms: 1000,
            flush_timeout_ms: 2000,
            artifact_dir: std::env::temp_dir().join("screenlink"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Orchestrator base URL; uploads are disabled without it
    pub api_base_url: Option<String>,
    pub token: Option<String>,
    pub auto_upload: bool,
    /// Per-attempt limit on a single part PUT
    pub part_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            token: None,
            auto_upload: true,
            part_timeout_secs: 120,
        }
    }
}

/// Configuration of the `screenlinkd` coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub ipc: IpcConfig,
    pub capture: CaptureConfig,
    pub recording: RecordingSection,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        load("SCREENLINK", config_file)
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            part_timeout: Duration::from_secs(self.upload.part_timeout_secs.max(1)),
            ..UploadSettings::default()
        }
    }

    /// Default start configuration for requests that carry none
    pub fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            display: self.capture.display.clone(),
            screen_width: self.capture.screen_width,
            screen_height: self.capture.screen_height,
            frame_rate: self.capture.frame_rate,
            capture_system_audio: self.capture.system_audio_enabled,
            system_audio_device_id: self.capture.system_audio_device.clone(),
            capture_microphone: self.capture.microphone_enabled,
            microphone_device_id: self.capture.microphone_device.clone(),
            capture_webcam: self.capture.webcam_enabled,
            webcam_device_id: self.capture.webcam_device.clone(),
            title: None,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            max_duration: Duration::from_secs(self.recording.max_duration_secs),
            timeslice: Duration::from_millis(self.recording.timeslice_ms.max(1)),
            flush_timeout: Duration::from_millis(self.recording.flush_timeout_ms),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            artifact_dir: self.recording.artifact_dir.clone(),
            auto_upload: self.upload.auto_upload,
        }
    }
}

// ---------------------------------------------------------------------------
// Server

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the in-memory repository is used when absent
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub s3: S3Config,
    /// HMAC key for URLs signed by the local backend
    pub local_signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            s3: S3Config::default(),
            local_signing_secret: "local-dev-secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub free_max_recordings: Option<u64>,
    pub pro_max_recordings: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_max_recordings: Some(25),
            pro_max_recordings: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub free_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { free_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

/// Configuration of `screenlink-server`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    /// Base of share and local storage URLs
    pub public_base_url: String,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub quota: QuotaConfig,
    pub retention: RetentionConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            public_base_url: "http://localhost:8080".to_string(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            quota: QuotaConfig::default(),
            retention: RetentionConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        load("SCREENLINK_SERVER", config_file)
    }

    /// Collect the problems that make this configuration unusable
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.auth.jwt_secret.len() < 8 {
            errors.push("auth.jwt_secret must be at least 8 characters".to_string());
        }
        if url::Url::parse(&self.public_base_url).is_err() {
            errors.push(format!("public_base_url is not a URL: {}", self.public_base_url));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_empty() {
            errors.push("storage.s3.bucket is required for the s3 backend".to_string());
        }
        if self.session.ttl_secs == 0 {
            errors.push("session.ttl_secs must be positive".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ipc.addr, "127.0.0.1:47700");
        assert_eq!(config.recording.max_duration_secs, 420);
        assert_eq!(config.controller_settings().timeslice, Duration::from_secs(1));
        assert!(config.upload.auto_upload);
        assert_eq!(config.recording_config().frame_rate, 30);
    }

    #[test]
    fn test_server_defaults_validate() {
        let config = ServerConfig::default();
        assert_eq!(config.quota.free_max_recordings, Some(25));
        assert_eq!(config.quota.pro_max_recordings, None);
        assert_eq!(config.session.ttl_secs, 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let mut config = ServerConfig::default();
        config.auth.jwt_secret = "x".to_string();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[recording]\nmax_duration_secs = 60\n\n[capture]\nbackend = \"synthetic\"\nwebcam_enabled = true"
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.recording.max_duration_secs, 60);
        assert_eq!(config.capture.backend, CaptureBackend::Synthetic);
        assert!(config.capture.webcam_enabled);
        // Untouched sections keep their defaults
        assert_eq!(config.ipc.addr, "127.0.0.1:47700");
    }
}
