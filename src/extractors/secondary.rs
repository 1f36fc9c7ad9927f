use async_trait::async_trait;
use rusty_ytdl::{Video, VideoOptions, VideoQuality, VideoSearchOptions};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::direct::discard_partial;
use super::{AcquireContext, AcquiredMedia, AcquisitionStrategy, StrategyOutcome};
use crate::utils::format_file_size;
use crate::Result;

const SECONDARY_EXTENSION: &str = "audio";

/// Last-resort extractor: resolves the video with an in-process YouTube client
/// and streams its highest-bitrate audio-only format to disk.
///
/// Failures here are logged and reported as "no result" so that the cascade ends in
/// `NoDownloadableFormat` rather than a tool error.
#[derive(Debug, Default, Clone)]
pub struct SecondaryExtractor;

impl SecondaryExtractor {
    pub fn new() -> Self {
        Self
    }

    fn video_options() -> VideoOptions {
        VideoOptions {
            quality: VideoQuality::HighestAudio,
            filter: VideoSearchOptions::Audio,
            ..Default::default()
        }
    }

    async fn stream_audio(&self, url: &str, dest: &Path) -> Result<u64> {
        let video = Video::new_with_options(url, Self::video_options())
            .map_err(|e| anyhow::anyhow!("cannot resolve {url}: {e}"))?;
        let stream = video
            .stream()
            .await
            .map_err(|e| anyhow::anyhow!("no audio-only stream: {e}"))?;

        let mut file = fs_err::tokio::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| anyhow::anyhow!("stream broke after {}: {e}", format_file_size(written)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            anyhow::bail!("audio stream was empty");
        }
        Ok(written)
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("secondary extraction cancelled")),
            result = self.stream_audio(url, dest) => result,
        };

        if result.is_err() {
            discard_partial(dest).await;
        }
        result
    }
}

#[async_trait]
impl AcquisitionStrategy for SecondaryExtractor {
    fn name(&self) -> &'static str {
        "secondary"
    }

    async fn attempt(&self, ctx: &AcquireContext<'_>) -> Result<StrategyOutcome> {
        let path = ctx
            .temp_dir
            .join(format!("{}.{}", ctx.file_stem, SECONDARY_EXTENSION));

        match self.download(ctx.url, &path, ctx.cancel).await {
            Ok(bytes) => {
                tracing::info!(
                    job_id = ctx.job_id,
                    size = %format_file_size(bytes),
                    dest = %path.display(),
                    "secondary extractor succeeded"
                );
                Ok(StrategyOutcome::Acquired(AcquiredMedia {
                    path,
                    extension: SECONDARY_EXTENSION.to_string(),
                }))
            }
            Err(e) => {
                tracing::error!(
                    job_id = ctx.job_id,
                    url = ctx.url,
                    error = %format!("{e:#}"),
                    "secondary extractor failed"
                );
                Ok(StrategyOutcome::NoResult)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(dir: &'a Path, url: &'a str, cancel: &'a CancellationToken) -> AcquireContext<'a> {
        AcquireContext {
            url,
            job_id: "job",
            file_stem: "job-a1",
            temp_dir: dir,
            cancel,
        }
    }

    #[test]
    fn test_prefers_audio_only_formats() {
        let options = SecondaryExtractor::video_options();
        assert!(matches!(options.quality, VideoQuality::HighestAudio));
        assert!(matches!(options.filter, VideoSearchOptions::Audio));
    }

    #[tokio::test]
    async fn test_unresolvable_url_is_no_result() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let ctx = context(dir.path(), "https://vimeo.com/1", &cancel);

        let outcome = SecondaryExtractor::new().attempt(&ctx).await.unwrap();
        assert!(matches!(outcome, StrategyOutcome::NoResult));
        assert!(!dir.path().join("job-a1.audio").exists());
    }

    #[tokio::test]
    async fn test_cancelled_attempt_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job-a1.audio"), b"PART").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context(dir.path(), "https://www.youtube.com/watch?v=abc", &cancel);

        let outcome = SecondaryExtractor::new().attempt(&ctx).await.unwrap();
        assert!(matches!(outcome, StrategyOutcome::NoResult));
        assert!(!dir.path().join("job-a1.audio").exists());
    }
}
