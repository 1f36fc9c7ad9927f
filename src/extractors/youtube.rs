use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{find_job_file, AcquireContext, AcquisitionStrategy, StrategyOutcome};
use crate::config::PipelineConfig;
use crate::utils::{run_command, stderr_summary};
use crate::Result;

/// Metadata returned by `yt-dlp --dump-single-json`
#[derive(Debug, Clone, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

/// One entry of the `formats` list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub acodec: Option<String>,
    /// Audio bitrate in kbit/s
    pub abr: Option<f64>,
    /// Overall bitrate in kbit/s
    pub tbr: Option<f64>,
}

impl FormatInfo {
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|codec| codec != "none")
    }

    fn bitrate(&self) -> f64 {
        self.abr.or(self.tbr).unwrap_or(0.0)
    }
}

impl VideoInfo {
    /// Highest-bitrate format carrying audio, or the first listed format when none is tagged
    pub fn best_audio_format(&self) -> Option<&FormatInfo> {
        self.formats
            .iter()
            .filter(|format| format.has_audio())
            .fold(None, |best: Option<&FormatInfo>, format| match best {
                Some(current) if current.bitrate() >= format.bitrate() => Some(current),
                _ => Some(format),
            })
            .or_else(|| self.formats.first())
    }
}

/// Audio extractor driving yt-dlp
#[derive(Debug, Clone)]
pub struct YoutubeExtractor {
    yt_dlp_path: String,
    ffmpeg_path: String,
    user_agent: String,
}

impl YoutubeExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            yt_dlp_path: config.yt_dlp_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    /// Get video information using yt-dlp
    pub async fn get_video_info(&self, url: &str, cancel: &CancellationToken) -> Result<VideoInfo> {
        tracing::debug!("Extracting video info for: {}", url);

        let mut command = Command::new(&self.yt_dlp_path);
        command.args(["--dump-single-json", "--no-playlist", "--no-warnings", url]);

        let output = run_command(command, cancel).await?;
        if !output.status.success() {
            anyhow::bail!("yt-dlp failed: {}", stderr_summary(&output));
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout)
            .context("yt-dlp returned unreadable metadata")?;

        Ok(info)
    }

    /// Download the best audio track, converted to MP3, under `output_template`
    pub async fn download_audio(
        &self,
        url: &str,
        output_template: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!("Downloading audio for: {}", url);

        let template = output_template.to_string_lossy();
        let mut command = Command::new(&self.yt_dlp_path);
        command.args([
            "--output", &*template,
            "--extract-audio",
            "--audio-format", "mp3",
            "--format", "bestaudio/best",
            "--no-playlist",
            "--geo-bypass",
            "--prefer-free-formats",
            "--user-agent", self.user_agent.as_str(),
            "--newline",
        ]);

        // yt-dlp finds ffmpeg on PATH unless told otherwise
        if Path::new(&self.ffmpeg_path)
            .parent()
            .is_some_and(|dir| !dir.as_os_str().is_empty())
        {
            command.args(["--ffmpeg-location", self.ffmpeg_path.as_str()]);
        }
        command.arg(url);

        let output = run_command(command, cancel).await?;
        if !output.status.success() {
            anyhow::bail!("Failed to download audio: {}", stderr_summary(&output));
        }

        Ok(())
    }
}

#[async_trait]
impl AcquisitionStrategy for YoutubeExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn attempt(&self, ctx: &AcquireContext<'_>) -> Result<StrategyOutcome> {
        let template = ctx.temp_dir.join(format!("{}.%(ext)s", ctx.file_stem));
        self.download_audio(ctx.url, &template, ctx.cancel).await?;

        Ok(match find_job_file(ctx.temp_dir, ctx.file_stem).await? {
            Some(media) => StrategyOutcome::Acquired(media),
            None => StrategyOutcome::NoResult,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, acodec: Option<&str>, abr: Option<f64>, tbr: Option<f64>) -> FormatInfo {
        FormatInfo {
            format_id: Some(id.to_string()),
            url: Some(format!("https://media.example/{id}")),
            ext: Some("webm".to_string()),
            acodec: acodec.map(str::to_string),
            abr,
            tbr,
        }
    }

    fn info(formats: Vec<FormatInfo>) -> VideoInfo {
        VideoInfo {
            id: Some("abc".to_string()),
            title: None,
            duration: None,
            formats,
        }
    }

    #[test]
    fn test_prefers_highest_audio_bitrate() {
        let info = info(vec![
            format("video", Some("none"), None, Some(2000.0)),
            format("low", Some("opus"), Some(48.0), None),
            format("high", Some("opus"), Some(160.0), None),
            format("mid", Some("mp4a.40.2"), Some(128.0), None),
        ]);
        assert_eq!(info.best_audio_format().unwrap().format_id.as_deref(), Some("high"));
    }

    #[test]
    fn test_falls_back_to_total_bitrate() {
        let info = info(vec![
            format("a", Some("opus"), None, Some(70.0)),
            format("b", Some("opus"), None, Some(130.0)),
        ]);
        assert_eq!(info.best_audio_format().unwrap().format_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_falls_back_to_first_format() {
        let info = info(vec![
            format("first", None, None, None),
            format("second", Some("none"), None, None),
        ]);
        assert_eq!(info.best_audio_format().unwrap().format_id.as_deref(), Some("first"));
        assert!(VideoInfo { formats: vec![], ..info }.best_audio_format().is_none());
    }

    #[test]
    fn test_parses_yt_dlp_json() {
        let json = r#"{
            "id": "abc",
            "title": "A talk",
            "duration": 321.0,
            "formats": [
                {"format_id": "251", "url": "https://x/251", "ext": "webm", "acodec": "opus", "abr": 130.5, "vcodec": "none"},
                {"format_id": "18", "url": "https://x/18", "ext": "mp4", "acodec": "mp4a.40.2", "tbr": 500}
            ]
        }"#;
        let info: VideoInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.title.as_deref(), Some("A talk"));
        assert_eq!(info.formats.len(), 2);
        assert_eq!(info.best_audio_format().unwrap().format_id.as_deref(), Some("18"));
    }
}
