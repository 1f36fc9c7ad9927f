//! ytclip - cut audio clips out of YouTube videos and publish them to object storage
//!
//! A request names a video URL and a time range. The pipeline acquires the full audio
//! track (trying several extraction strategies with retry), trims the requested range
//! into MP3 with ffmpeg, uploads the clip to S3-compatible storage and hands back a
//! public URL.

pub mod cli;
pub mod config;
pub mod extractors;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod timestamp;
pub mod trim;
pub mod utils;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use extractors::{AcquireError, AcquiredMedia, SourceAcquirer};
pub use pipeline::{ClipOutcome, ClipPipeline};
pub use storage::{PublishError, PublishResult, Publisher, S3Publisher};
pub use timestamp::{ClipRequest, ValidationError};
pub use trim::{FfmpegTrimmer, TranscodeError, TrimmedClip};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Error surfaced by a clip pipeline execution
#[derive(thiserror::Error, Debug)]
pub enum ClipError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("audio acquisition failed: {0}")]
    Acquisition(#[from] AcquireError),

    #[error("trimming failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("publishing failed: {0}")]
    Publish(#[from] PublishError),

    #[error("request timed out after {}s", .0.as_secs())]
    RequestTimeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("working directory error: {0}")]
    Io(#[from] std::io::Error),
}
