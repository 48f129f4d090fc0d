//! CLI entry point for the media relay daemon
//!
//! Parses command line arguments, sets up logging and runs the daemon with
//! its HTTP API until Ctrl-C.

use clap::Parser;
use relay_daemon::{run_api_server, Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Media Relay Daemon - download, convert and upload media on request
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (yt-dlp, ffmpeg). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relay_daemon=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    info!("Media relay daemon starting (config: {})", args.config.display());

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Config::load_or_default(&args.config)
            .map(Daemon::new_without_checks)
            .map_err(|e| e.into())
    } else {
        Daemon::new(&args.config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    daemon.start();
    info!(
        "Daemon running with {} workers; API on http://{}",
        daemon.config().workers.effective_count(),
        daemon.config().server.bind
    );

    let shutdown = daemon.shutdown_token();
    let server = tokio::spawn(run_api_server(daemon.clone(), shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }

    daemon.shutdown().await;

    match server.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("API server error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("API server task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
