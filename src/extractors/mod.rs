use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub mod direct;
pub mod metadata;
pub mod retry;
pub mod secondary;
pub mod youtube;

use crate::config::{PipelineConfig, BASE_BACKOFF, MAX_ACQUIRE_ATTEMPTS};
use crate::Result;
use retry::AttemptState;

/// Suffixes yt-dlp uses for files it has not finished writing
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(https?://(www\.)?)?(youtube\.com|youtu\.be)/.+")
        .expect("youtube url pattern is valid")
});

/// A full-length audio track on local disk
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredMedia {
    pub path: PathBuf,
    /// File extension as produced by the strategy that fetched it
    pub extension: String,
}

/// What one strategy made of an attempt
#[derive(Debug)]
pub enum StrategyOutcome {
    Acquired(AcquiredMedia),
    /// Nothing usable; the next strategy should be tried
    NoResult,
}

/// Inputs shared by every strategy of one acquisition attempt
#[derive(Clone, Copy)]
pub struct AcquireContext<'a> {
    /// Normalized source URL
    pub url: &'a str,
    pub job_id: &'a str,
    /// Stem for every file this attempt writes: `<job_id>-a<attempt>`
    pub file_stem: &'a str,
    pub temp_dir: &'a Path,
    pub cancel: &'a CancellationToken,
}

/// One way of getting an audio track for a URL
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Try to produce the audio file. Errors abort the remaining strategies of this attempt.
    async fn attempt(&self, ctx: &AcquireContext<'_>) -> Result<StrategyOutcome>;
}

#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    #[error("no downloadable format found (private/age-restricted/geo-blocked)")]
    NoDownloadableFormat,

    #[error("download timeout after {}s", .0.as_secs())]
    DownloadTimeout(Duration),

    #[error("download failed after {attempts} attempts: {reason}")]
    Failed { attempts: u32, reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("cannot prepare working directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the pipeline and whatever produces the source audio
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn acquire(
        &self,
        url: &str,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<AcquiredMedia, AcquireError>;
}

/// Retry and timeout policy of a [`SourceAcquirer`]
#[derive(Debug, Clone)]
pub struct AcquireSettings {
    pub temp_dir: PathBuf,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl AcquireSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            max_attempts: MAX_ACQUIRE_ATTEMPTS,
            base_backoff: BASE_BACKOFF,
            timeout: config.download_timeout,
        }
    }
}

/// Runs an ordered cascade of strategies with retry, backoff and an overall timeout
pub struct SourceAcquirer {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    settings: AcquireSettings,
}

impl SourceAcquirer {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>, settings: AcquireSettings) -> Self {
        Self {
            strategies,
            settings,
        }
    }

    /// Default cascade: yt-dlp download, metadata-driven direct fetch, secondary extractor
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let youtube = youtube::YoutubeExtractor::new(config);
        let fetcher = direct::DirectFetcher::new(&config.user_agent)?;

        Ok(Self::new(
            vec![
                Box::new(youtube.clone()),
                Box::new(metadata::MetadataStrategy::new(youtube, fetcher)),
                Box::new(secondary::SecondaryExtractor::new()),
            ],
            AcquireSettings::from_config(config),
        ))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// One pass over the cascade. `Ok(None)` means every strategy came up empty.
    async fn run_cascade(
        &self,
        ctx: &AcquireContext<'_>,
        state: &AttemptState,
    ) -> Result<Option<AcquiredMedia>> {
        for strategy in &self.strategies {
            tracing::info!(
                job_id = ctx.job_id,
                attempt = state.attempt_number,
                strategy = strategy.name(),
                "trying acquisition strategy"
            );

            match strategy.attempt(ctx).await? {
                StrategyOutcome::Acquired(media) => {
                    tracing::info!(
                        job_id = ctx.job_id,
                        strategy = strategy.name(),
                        path = %media.path.display(),
                        "audio acquired"
                    );
                    return Ok(Some(media));
                }
                StrategyOutcome::NoResult => {
                    tracing::warn!(
                        job_id = ctx.job_id,
                        strategy = strategy.name(),
                        "strategy produced no file"
                    );
                }
            }
        }

        Ok(None)
    }

    async fn run_attempts(
        &self,
        ctx: &AcquireContext<'_>,
    ) -> std::result::Result<AcquiredMedia, AcquireError> {
        let mut state = AttemptState::first(self.settings.max_attempts, self.settings.base_backoff);

        loop {
            // A failed attempt may leave a truncated file behind; later attempts never see it
            let file_stem = attempt_file_stem(ctx.job_id, state.attempt_number);
            let attempt_ctx = AcquireContext {
                file_stem: &file_stem,
                ..*ctx
            };

            let failure = match self.run_cascade(&attempt_ctx, &state).await {
                Ok(Some(media)) => return Ok(media),
                Ok(None) => AcquireError::NoDownloadableFormat,
                Err(e) => {
                    tracing::error!(
                        job_id = ctx.job_id,
                        attempt = state.attempt_number,
                        error = %format!("{e:#}"),
                        "download attempt failed"
                    );
                    AcquireError::Failed {
                        attempts: state.attempt_number,
                        reason: format!("{e:#}"),
                    }
                }
            };

            if ctx.cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            if !state.has_remaining() {
                return Err(failure);
            }

            tracing::info!(
                job_id = ctx.job_id,
                next_attempt = state.attempt_number + 1,
                backoff_ms = state.backoff.as_millis() as u64,
                "retrying download"
            );
            tokio::select! {
                _ = tokio::time::sleep(state.backoff) => {}
                _ = ctx.cancel.cancelled() => return Err(AcquireError::Cancelled),
            }
            state = state.next();
        }
    }
}

#[async_trait]
impl Acquire for SourceAcquirer {
    async fn acquire(
        &self,
        url: &str,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<AcquiredMedia, AcquireError> {
        fs_err::tokio::create_dir_all(&self.settings.temp_dir).await?;

        let normalized = normalize_youtube_url(url);
        tracing::info!(job_id, url = %normalized, "starting download");

        // Child token: a timeout stops this acquisition's processes without touching the caller's
        let attempt_cancel = cancel.child_token();
        let ctx = AcquireContext {
            url: &normalized,
            job_id,
            file_stem: job_id,
            temp_dir: &self.settings.temp_dir,
            cancel: &attempt_cancel,
        };

        match tokio::time::timeout(self.settings.timeout, self.run_attempts(&ctx)).await {
            Ok(result) => result,
            Err(_) => {
                attempt_cancel.cancel();
                tracing::error!(job_id, timeout_secs = self.settings.timeout.as_secs(), "download timeout");
                Err(AcquireError::DownloadTimeout(self.settings.timeout))
            }
        }
    }
}

/// File stem of one attempt. Starts with the job id so the job's cleanup sweep covers it.
pub fn attempt_file_stem(job_id: &str, attempt_number: u32) -> String {
    format!("{job_id}-a{attempt_number}")
}

/// Look for a finished file named `<file_stem>.<ext>` in `dir`
pub async fn find_job_file(dir: &Path, file_stem: &str) -> Result<Option<AcquiredMedia>> {
    let prefix = format!("{file_stem}.");
    let mut entries = fs_err::tokio::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }

        let extension = name[prefix.len()..].to_string();
        return Ok(Some(AcquiredMedia {
            path: entry.path(),
            extension,
        }));
    }

    Ok(None)
}

/// Whether `url` looks like a YouTube watch or short link
pub fn is_valid_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// Rebuild short links and watch URLs as `https://www.youtube.com/watch?v=<id>`.
///
/// Anything unparseable, or without a video id, is returned unchanged.
pub fn normalize_youtube_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let video_id = if parsed.host_str().is_some_and(|host| host.contains("youtu.be")) {
        parsed.path().trim_start_matches('/').to_string()
    } else {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default()
    };

    if video_id.is_empty() {
        return url.to_string();
    }

    format!("https://www.youtube.com/watch?v={}", video_id)
}
