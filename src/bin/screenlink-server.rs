//! screenlink-server - upload orchestrator and share link service

use anyhow::Context;
use clap::{Parser, Subcommand};
use screenlink::config::ServerConfig;
use screenlink::logging::init_logging;
use screenlink::server::models::Tier;
use screenlink::server::{JwtService, Service};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "screenlink-server")]
#[command(version)]
#[command(about = "Upload orchestrator for screenlink recordings")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SCREENLINK_SERVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Print a bearer token for a user
    IssueToken {
        owner_id: String,
        #[arg(long, value_parser = parse_tier, default_value = "free")]
        tier: Tier,
        /// Lifetime in hours
        #[arg(long, default_value_t = 24 * 30)]
        hours: i64,
    },
}

fn parse_tier(value: &str) -> Result<Tier, String> {
    match value {
        "free" => Ok(Tier::Free),
        "pro" => Ok(Tier::Pro),
        other => Err(format!("unknown tier {other}, expected free or pro")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {e}");
        }
        anyhow::bail!("invalid configuration ({} problems)", errors.len());
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::IssueToken { owner_id, tier, hours } => {
            let token = JwtService::new(&config.auth.jwt_secret)
                .issue(&owner_id, tier, chrono::Duration::hours(hours))?;
            println!("{token}");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    init_logging(&config.logging)?;
    info!("Starting screenlink-server v{}", env!("CARGO_PKG_VERSION"));

    let service = Service::from_config(&config).await?;
    let shutdown = CancellationToken::new();
    let sweeper = service.state.orchestrator.spawn_sweeper(
        std::time::Duration::from_secs(config.session.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("cannot listen on {}", config.http.bind))?;
    info!("HTTP listening on {}", config.http.bind);

    let graceful = shutdown.clone();
    let server = axum::serve(listener, service.router())
        .with_graceful_shutdown(async move { graceful.cancelled().await });
    let server = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
        }
    });

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    shutdown.cancel();
    let _ = server.await;
    let _ = sweeper.await;
    Ok(())
}
