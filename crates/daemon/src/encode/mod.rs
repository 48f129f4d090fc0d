//! Transcoding collaborators

pub mod ffmpeg;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use ffmpeg::{
    build_ffmpeg_command, h264_output_path, FfmpegTranscoder, TranscodeError, FFMPEG_COMPAT_ARGS,
};

/// Target codec profile for a re-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecProfile {
    /// H.264 main profile with AAC audio, tuned for broad player support
    H264Compat,
}

/// Re-encodes a local media file.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce a new file from `input`; the input is left in place.
    async fn transcode(&self, input: &Path, profile: CodecProfile)
        -> Result<PathBuf, TranscodeError>;
}
