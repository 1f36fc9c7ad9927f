use anyhow::{Context, Result};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Serialize a second count as an integer when it is whole, `30` rather than `30.0`
pub fn serialize_seconds<S>(seconds: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if seconds.fract() == 0.0 && *seconds >= 0.0 && *seconds <= u64::MAX as f64 {
        serializer.serialize_u64(*seconds as u64)
    } else {
        serializer.serialize_f64(*seconds)
    }
}

/// Last non-empty line of a tool's stderr, for error messages
pub fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| format!("exited with {}", output.status))
}

/// Run a command to completion, killing it if `cancel` fires first.
///
/// The child is spawned with `kill_on_drop`, so dropping the returned future (a timeout
/// around the caller, for instance) also terminates the process.
pub async fn run_command(mut command: Command, cancel: &CancellationToken) -> Result<Output> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    tokio::select! {
        output = child.wait_with_output() => {
            output.with_context(|| format!("Failed to wait for {}", program))
        }
        _ = cancel.cancelled() => {
            anyhow::bail!("{} cancelled", program)
        }
    }
}

/// Check if the current environment has required tools
pub async fn check_dependencies(pipeline: &PipelineConfig) -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available(&pipeline.yt_dlp_path).await {
        missing.push(format!(
            "{} - required for audio extraction",
            pipeline.yt_dlp_path
        ));
    }

    if !check_command_available(&pipeline.ffmpeg_path).await {
        missing.push(format!(
            "{} - required for trimming and audio conversion",
            pipeline.ffmpeg_path
        ));
    }

    missing
}

/// Check if a command is available
async fn check_command_available(command: &str) -> bool {
    if which::which(command).is_err() {
        return false;
    }

    // ffmpeg only understands -version
    let flag = if command.ends_with("ffmpeg") { "-version" } else { "--version" };

    Command::new(command)
        .arg(flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m 1s");
    }

    #[test]
    fn test_serialize_seconds() {
        #[derive(serde::Serialize)]
        struct Clip {
            #[serde(serialize_with = "serialize_seconds")]
            seconds: f64,
        }

        let json = |seconds| serde_json::to_string(&Clip { seconds }).unwrap();
        assert_eq!(json(30.0), r#"{"seconds":30}"#);
        assert_eq!(json(0.0), r#"{"seconds":0}"#);
        assert_eq!(json(12.5), r#"{"seconds":12.5}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo hello; echo oops >&2; exit 3"]);

        let output = run_command(command, &CancellationToken::new()).await.unwrap();
        assert!(!output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(stderr_summary(&output), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_honours_cancellation() {
        let mut command = Command::new("sleep");
        command.arg("30");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        assert!(run_command(command, &cancel).await.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let pipeline = PipelineConfig {
            yt_dlp_path: "definitely-not-a-real-binary-ytclip".to_string(),
            ..PipelineConfig::default()
        };
        let missing = check_dependencies(&pipeline).await;
        assert!(missing
            .iter()
            .any(|entry| entry.starts_with("definitely-not-a-real-binary-ytclip")));
    }
}
