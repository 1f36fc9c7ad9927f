use async_trait::async_trait;

use super::direct::DirectFetcher;
use super::youtube::YoutubeExtractor;
use super::{AcquireContext, AcquiredMedia, AcquisitionStrategy, StrategyOutcome};
use crate::Result;

/// Picks a format from yt-dlp's metadata and fetches its direct URL over HTTP
pub struct MetadataStrategy {
    extractor: YoutubeExtractor,
    fetcher: DirectFetcher,
}

impl MetadataStrategy {
    pub fn new(extractor: YoutubeExtractor, fetcher: DirectFetcher) -> Self {
        Self { extractor, fetcher }
    }
}

#[async_trait]
impl AcquisitionStrategy for MetadataStrategy {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn attempt(&self, ctx: &AcquireContext<'_>) -> Result<StrategyOutcome> {
        let info = self.extractor.get_video_info(ctx.url, ctx.cancel).await?;
        tracing::info!(
            title = info.title.as_deref().unwrap_or("-"),
            formats = info.formats.len(),
            "video info retrieved"
        );

        let Some(chosen) = info.best_audio_format() else {
            return Ok(StrategyOutcome::NoResult);
        };
        let Some(url) = chosen.url.as_deref() else {
            return Ok(StrategyOutcome::NoResult);
        };

        let extension = chosen.ext.clone().unwrap_or_else(|| "m4a".to_string());
        let path = ctx.temp_dir.join(format!("{}.{}", ctx.file_stem, extension));
        tracing::info!(
            format_id = chosen.format_id.as_deref().unwrap_or("-"),
            dest = %path.display(),
            "downloading direct format url"
        );

        self.fetcher.fetch_to_file(url, &path, ctx.cancel).await?;

        Ok(StrategyOutcome::Acquired(AcquiredMedia { path, extension }))
    }
}
