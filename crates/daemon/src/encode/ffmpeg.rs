//! FFmpeg transcoder
//!
//! Re-encodes downloaded video into H.264/AAC MP4 so it plays back on
//! older devices and in browsers.

use super::{CodecProfile, Transcoder};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Encoder arguments for the H.264 compatibility profile
pub const FFMPEG_COMPAT_ARGS: &[&str] = &[
    "-c:v", "libx264",
    "-profile:v", "main",
    "-preset", "fast",
    "-pix_fmt", "yuv420p",
    "-c:a", "aac",
    "-b:a", "128k",
    "-movflags", "+faststart",
];

/// Error type for transcoding operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscodeError {
    /// ffmpeg binary could not be started
    #[error("FFmpeg not found or not executable; H.264 conversion is not possible")]
    ToolMissing,

    /// ffmpeg exited with non-zero status
    #[error("H.264 conversion with FFmpeg failed (exit code {0})")]
    Failed(i32),

    /// ffmpeg was terminated by a signal
    #[error("FFmpeg process was terminated by signal")]
    Terminated,

    /// IO error while running ffmpeg
    #[error("IO error during conversion: {0}")]
    Io(String),
}

/// Output path for the converted file: `<stem>_h264.mp4` next to the input
pub fn h264_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}_h264.mp4", stem))
}

/// Build the ffmpeg command for a profile
///
/// Input first, `-y` to overwrite stale partial output, then the profile's
/// encoder arguments and the output path.
pub fn build_ffmpeg_command(input: &Path, output: &Path, profile: CodecProfile) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-i").arg(input).arg("-y");
    match profile {
        CodecProfile::H264Compat => {
            cmd.args(FFMPEG_COMPAT_ARGS);
        }
    }
    cmd.arg(output);
    cmd
}

/// Transcoder that shells out to ffmpeg
///
/// A failed run leaves no partial output behind.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder;

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        profile: CodecProfile,
    ) -> Result<PathBuf, TranscodeError> {
        let output = h264_output_path(input);
        let mut cmd = build_ffmpeg_command(input, &output, profile);
        cmd.stdin(Stdio::null());

        info!("Running ffmpeg for {}", input.display());
        let result = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TranscodeError::ToolMissing,
            _ => TranscodeError::Io(e.to_string()),
        })?;

        let stderr = String::from_utf8_lossy(&result.stderr);
        if result.status.success() {
            debug!("ffmpeg stderr:\n{}", stderr);
            return Ok(output);
        }

        error!("ffmpeg stderr:\n{}", stderr);
        if output.exists() {
            if let Err(e) = tokio::fs::remove_file(&output).await {
                warn!("Could not remove partial output {}: {}", output.display(), e);
            }
        }
        match result.status.code() {
            Some(code) => Err(TranscodeError::Failed(code)),
            None => Err(TranscodeError::Terminated),
        }
    }
}
