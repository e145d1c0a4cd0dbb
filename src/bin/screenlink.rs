//! screenlink - command line front-end for screenlinkd

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use screenlink::config::ClientConfig;
use screenlink::ipc::{IpcClient, IpcRequest, IpcResponse};
use screenlink::recorder::{StatusSnapshot, UploadStatus};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "screenlink")]
#[command(version)]
#[command(about = "Record your screen and share it as a link")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SCREENLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator address, defaults to `ipc.addr`
    #[arg(long)]
    addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new recording
    Start {
        /// Overlay the webcam in the bottom-right corner
        #[arg(long)]
        webcam: bool,
        #[arg(long)]
        no_microphone: bool,
        #[arg(long)]
        no_system_audio: bool,
        /// Title of the shared recording
        #[arg(long)]
        title: Option<String>,
    },
    Pause,
    Resume,
    /// Stop and save the recording; the upload continues in the background
    Stop,
    Status,
    /// Follow the running recording, rebuilding the timer from the coordinator
    Attach,
    /// Upload the last recording again after a failure
    RetryUpload,
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn describe(snapshot: &StatusSnapshot) -> String {
    let mut line = format!("{:?}", snapshot.status).to_lowercase();
    if snapshot.is_recording {
        line.push_str(&format!(
            "  {}",
            format_elapsed(snapshot.derived_elapsed(Utc::now()))
        ));
    }
    match &snapshot.upload {
        UploadStatus::Idle => {}
        UploadStatus::Uploading { percent } => line.push_str(&format!("  uploading {percent:.0}%")),
        UploadStatus::Uploaded { share_url, .. } => line.push_str(&format!("  shared at {share_url}")),
        UploadStatus::Failed { message, artifact_path } => line.push_str(&format!(
            "  upload failed: {message} (kept at {}, run `screenlink retry-upload`)",
            artifact_path.display()
        )),
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!("  last error: {error}"));
    }
    line
}

async fn request(client: &mut IpcClient, request: &IpcRequest) -> anyhow::Result<IpcResponse> {
    match client.request(request).await? {
        IpcResponse::Error { code, message } => bail!("{message} [{code}]"),
        response => Ok(response),
    }
}

async fn status(client: &mut IpcClient) -> anyhow::Result<StatusSnapshot> {
    match request(client, &IpcRequest::Status).await? {
        IpcResponse::Status { snapshot } => Ok(snapshot),
        other => bail!("unexpected response: {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let addr = cli.addr.unwrap_or_else(|| config.ipc.addr.clone());

    let mut client = IpcClient::connect(&addr)
        .await
        .with_context(|| format!("screenlinkd is not reachable at {addr}"))?;

    match cli.command {
        Command::Start {
            webcam,
            no_microphone,
            no_system_audio,
            title,
        } => {
            let mut recording = config.recording_config();
            recording.capture_webcam |= webcam;
            recording.capture_microphone &= !no_microphone;
            recording.capture_system_audio &= !no_system_audio;
            recording.title = title.or(recording.title);

            request(&mut client, &IpcRequest::Start { config: Some(recording) }).await?;
            println!("Recording. Run `screenlink stop` to finish.");
        }
        Command::Pause => {
            request(&mut client, &IpcRequest::Pause).await?;
            println!("Paused");
        }
        Command::Resume => {
            request(&mut client, &IpcRequest::Resume).await?;
            println!("Resumed");
        }
        Command::Stop => {
            if let IpcResponse::Stopped { artifact } = request(&mut client, &IpcRequest::Stop).await? {
                println!(
                    "Saved {:.1}s ({} bytes) to {}",
                    artifact.duration_seconds,
                    artifact.byte_size,
                    artifact.path.display()
                );
            }
        }
        Command::Status => {
            println!("{}", describe(&status(&mut client).await?));
        }
        Command::Attach => {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        // The coordinator is the authority; ask every tick.
                        let snapshot = status(&mut client).await?;
                        println!("{}", describe(&snapshot));
                    }
                }
            }
        }
        Command::RetryUpload => {
            request(&mut client, &IpcRequest::RetryUpload).await?;
            println!("Upload restarted");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00");
        assert_eq!(format_elapsed(Duration::from_secs(421)), "07:01");
    }
}
