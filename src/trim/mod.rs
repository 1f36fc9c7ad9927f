//! Cutting a time range out of an audio file with ffmpeg.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::utils::{run_command, stderr_summary};

/// Extension of every trimmed clip
pub const CLIP_EXTENSION: &str = "mp3";

/// Content type published for every trimmed clip
pub const CLIP_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct TranscodeError(pub String);

/// A trimmed clip on local disk
#[derive(Debug, Clone, PartialEq)]
pub struct TrimmedClip {
    pub path: PathBuf,
}

#[async_trait]
pub trait Trim: Send + Sync {
    /// Write `[start, start + duration)` of `input` to `output` as MP3
    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        start_seconds: f64,
        duration_seconds: f64,
        cancel: &CancellationToken,
    ) -> Result<TrimmedClip, TranscodeError>;
}

pub struct FfmpegTrimmer {
    ffmpeg_path: String,
}

impl FfmpegTrimmer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }

    fn command(&self, input: &Path, output: &Path, start_seconds: f64, duration_seconds: f64) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
            .arg("-ss")
            .arg(format!("{start_seconds:.3}"))
            .arg("-i")
            .arg(input)
            .arg("-t")
            .arg(format!("{duration_seconds:.3}"))
            .args(["-vn", "-acodec", "libmp3lame", "-f", "mp3"])
            .arg(output);
        command
    }
}

#[async_trait]
impl Trim for FfmpegTrimmer {
    async fn trim(
        &self,
        input: &Path,
        output: &Path,
        start_seconds: f64,
        duration_seconds: f64,
        cancel: &CancellationToken,
    ) -> Result<TrimmedClip, TranscodeError> {
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            start_seconds,
            duration_seconds,
            "trimming"
        );

        match tokio::fs::metadata(input).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(TranscodeError(format!("{} is not a file", input.display()))),
            Err(e) => return Err(TranscodeError(format!("cannot read {}: {}", input.display(), e))),
        }

        let command = self.command(input, output, start_seconds, duration_seconds);
        let result = run_command(command, cancel)
            .await
            .map_err(|e| TranscodeError(format!("{e:#}")))?;

        if !result.status.success() {
            return Err(TranscodeError(format!(
                "ffmpeg failed: {}",
                stderr_summary(&result)
            )));
        }

        Ok(TrimmedClip {
            path: output.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trimmer(ffmpeg: &str) -> FfmpegTrimmer {
        FfmpegTrimmer {
            ffmpeg_path: ffmpeg.to_string(),
        }
    }

    #[test]
    fn test_command_line() {
        let command = trimmer("ffmpeg").command(Path::new("in.webm"), Path::new("out.mp3"), 10.0, 30.0);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let position = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[position("-ss") + 1], "10.000");
        assert_eq!(args[position("-t") + 1], "30.000");
        assert_eq!(args[position("-acodec") + 1], "libmp3lame");
        assert!(position("-ss") < position("-i"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp3"));
    }

    #[tokio::test]
    async fn test_missing_input_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = trimmer("ffmpeg")
            .trim(
                &dir.path().join("missing.webm"),
                &dir.path().join("out.mp3"),
                0.0,
                10.0,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.0.contains("cannot read"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_failure_is_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.webm");
        std::fs::write(&input, b"not really audio").unwrap();

        let err = trimmer("false")
            .trim(&input, &dir.path().join("out.mp3"), 0.0, 10.0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.0.starts_with("ffmpeg failed"));
    }
}
