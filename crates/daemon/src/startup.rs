//! Startup checks
//!
//! Preflight checks run before the daemon accepts work:
//! - yt-dlp must be runnable (fatal)
//! - ffmpeg should be runnable (warning only; H.264 jobs fail individually)
//! - the download directory must be creatable

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("yt-dlp not available: {0}")]
    YtDlpUnavailable(String),

    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Download directory {path} is not usable: {source}")]
    DownloadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `binary version_arg` and return the first line of its output.
pub fn probe_tool(binary: &str, version_arg: &str) -> Result<String, String> {
    let output = Command::new(binary)
        .arg(version_arg)
        .output()
        .map_err(|e| format!("{} {} failed; is it installed and in PATH? Error: {}", binary, version_arg, e))?;

    if !output.status.success() {
        return Err(format!(
            "{} {} exited with {}",
            binary, version_arg, output.status
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Check that yt-dlp runs.
pub fn check_ytdlp_available() -> Result<String, StartupError> {
    probe_tool("yt-dlp", "--version").map_err(StartupError::YtDlpUnavailable)
}

/// Check that ffmpeg runs.
pub fn check_ffmpeg_available() -> Result<String, StartupError> {
    probe_tool("ffmpeg", "-version").map_err(StartupError::FfmpegUnavailable)
}

/// Parse the major version from `ffmpeg -version` output.
///
/// Handles both "ffmpeg version 6.1.1 ..." and git builds like
/// "ffmpeg version n7.0-...".
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    version_part
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Run all startup checks in order.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let ytdlp = check_ytdlp_available()?;
    info!("yt-dlp version: {}", ytdlp);

    match check_ffmpeg_available() {
        Ok(line) => match parse_ffmpeg_version(&line) {
            Some(major) => info!("FFmpeg major version: {}", major),
            None => info!("FFmpeg found: {}", line),
        },
        Err(e) => warn!("{}; H.264 conversion and MP3 extraction will fail", e),
    }

    std::fs::create_dir_all(&cfg.fetch.download_dir).map_err(|source| {
        StartupError::DownloadDir {
            path: cfg.fetch.download_dir.display().to_string(),
            source,
        }
    })?;

    if !cfg.storage.is_complete() {
        warn!("Storage configuration incomplete; submissions will be rejected");
    }
    match &cfg.fetch.cookie_file {
        Some(path) if !path.exists() => {
            warn!("Cookie file {} does not exist", path.display())
        }
        Some(path) => info!("Using cookie file {}", path.display()),
        None => info!("No cookie file configured"),
    }

    Ok(())
}
