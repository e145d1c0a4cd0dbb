//! screenlinkd - background recording coordinator
//!
//! Owns the capture devices, the encoder and the upload of finished
//! recordings. UIs attach over the local IPC socket and may come and go
//! while a recording runs.

use anyhow::Context;
use clap::Parser;
use screenlink::capture::synthetic::{SyntheticDevices, SyntheticSourceProvider};
use screenlink::capture::{FfmpegSourceProvider, Resolution, SourceProvider};
use screenlink::commands::RecorderState;
use screenlink::config::{CaptureBackend, ClientConfig};
use screenlink::logging::init_logging;
use screenlink::recorder::{spawn_supervisor, FfmpegEncoderFactory, RecordingCoordinator};
use screenlink::upload::{ApiClient, ArtifactUploader, UploadPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "screenlinkd")]
#[command(version)]
#[command(about = "Screen recording coordinator")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SCREENLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the IPC listen address
    #[arg(long)]
    listen: Option<String>,

    /// Use test patterns instead of real devices
    #[arg(long)]
    synthetic: bool,
}

fn source_provider(config: &ClientConfig) -> Arc<dyn SourceProvider> {
    match config.capture.backend {
        CaptureBackend::Ffmpeg => Arc::new(FfmpegSourceProvider::new(config.capture.ffmpeg_path.clone())),
        CaptureBackend::Synthetic => {
            let size = Resolution::new(
                config.capture.screen_width.unwrap_or(1280),
                config.capture.screen_height.unwrap_or(720),
            );
            Arc::new(SyntheticSourceProvider::new(SyntheticDevices::default(), size))
        }
    }
}

fn uploader(config: &ClientConfig) -> anyhow::Result<Option<Arc<dyn ArtifactUploader>>> {
    let Some(base_url) = &config.upload.api_base_url else {
        warn!("No upload.api_base_url configured, recordings stay on disk");
        return Ok(None);
    };
    let api = ApiClient::new(base_url, config.upload.token.as_deref())
        .context("invalid upload configuration")?;
    Ok(Some(Arc::new(UploadPipeline::new(api, config.upload_settings()))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ClientConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.ipc.addr = listen;
    }
    if cli.synthetic {
        config.capture.backend = CaptureBackend::Synthetic;
    }

    init_logging(&config.logging)?;
    info!("Starting screenlinkd v{}", env!("CARGO_PKG_VERSION"));

    tokio::fs::create_dir_all(&config.recording.artifact_dir)
        .await
        .with_context(|| format!("cannot create {}", config.recording.artifact_dir.display()))?;

    let (coordinator, stop_requests) = RecordingCoordinator::new(
        source_provider(&config),
        Arc::new(FfmpegEncoderFactory::new(config.capture.ffmpeg_path.clone())),
        config.controller_settings(),
        config.coordinator_settings(),
        uploader(&config)?,
    );
    let handle = coordinator.into_handle();
    let supervisor = spawn_supervisor(handle.clone(), stop_requests);

    let state = RecorderState::new(handle.clone(), config.recording_config()).await;
    let listener = TcpListener::bind(&config.ipc.addr)
        .await
        .with_context(|| format!("cannot listen on {}", config.ipc.addr))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(screenlink::ipc::serve(listener, state, shutdown.clone()));

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    shutdown.cancel();
    let _ = server.await;

    // Never leave devices open or drop a recording in progress
    let mut coordinator = handle.lock().await;
    if coordinator.state().is_active() {
        match coordinator.stop().await {
            Ok(artifact) => info!("Saved in-progress recording to {}", artifact.path.display()),
            Err(e) => warn!("Could not finalize in-progress recording: {}", e),
        }
    }
    coordinator.wait_for_upload().await;
    supervisor.abort();

    info!("screenlinkd stopped");
    Ok(())
}
