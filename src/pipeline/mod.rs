//! Acquire, trim, publish and clean up one clip under a global concurrency cap.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

pub mod cleanup;

use crate::config::Config;
use crate::extractors::{Acquire, SourceAcquirer};
use crate::storage::{destination_path, Publisher};
use crate::timestamp::ClipRequest;
use crate::trim::{FfmpegTrimmer, Trim, CLIP_EXTENSION};
use crate::utils::serialize_seconds;
use crate::ClipError;
use cleanup::{Cleanup, CleanupReport};

/// Where a pipeline execution currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Validated,
    Acquiring,
    Trimming,
    Publishing,
    CleaningUp,
    Completed,
    Errored,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Validated => "validated",
            PipelineStage::Acquiring => "acquiring",
            PipelineStage::Trimming => "trimming",
            PipelineStage::Publishing => "publishing",
            PipelineStage::CleaningUp => "cleaning_up",
            PipelineStage::Completed => "completed",
            PipelineStage::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A published clip
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipOutcome {
    pub job_id: String,
    pub public_url: String,
    pub storage_path: String,
    #[serde(serialize_with = "serialize_seconds")]
    pub duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub bucket: String,
    pub key_prefix: String,
    pub request_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temp_dir: config.pipeline.temp_dir.clone(),
            bucket: config.storage.bucket.clone(),
            key_prefix: config.storage.key_prefix.clone(),
            request_timeout: config.pipeline.request_timeout,
        }
    }
}

/// Runs clip requests; at most `concurrency` of them are past admission at once
pub struct ClipPipeline {
    acquirer: Arc<dyn Acquire>,
    trimmer: Arc<dyn Trim>,
    publisher: Arc<dyn Publisher>,
    slots: Arc<Semaphore>,
    settings: PipelineSettings,
}

impl ClipPipeline {
    pub fn new(
        acquirer: Arc<dyn Acquire>,
        trimmer: Arc<dyn Trim>,
        publisher: Arc<dyn Publisher>,
        concurrency: usize,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            acquirer,
            trimmer,
            publisher,
            slots: Arc::new(Semaphore::new(concurrency)),
            settings,
        }
    }

    /// Production wiring: yt-dlp cascade, ffmpeg trimmer and the given publisher
    pub fn from_config(config: &Config, publisher: Arc<dyn Publisher>) -> crate::Result<Self> {
        let acquirer = SourceAcquirer::from_config(&config.pipeline)?;
        let trimmer = FfmpegTrimmer::new(&config.pipeline);

        Ok(Self::new(
            Arc::new(acquirer),
            Arc::new(trimmer),
            publisher,
            config.pipeline.concurrency,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn temp_dir(&self) -> &Path {
        &self.settings.temp_dir
    }

    /// Slots not currently held by a running request
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run one validated request to completion.
    ///
    /// The request deadline starts now and covers waiting for a slot. Temporary files are
    /// removed before this returns, on success and on every error path.
    pub async fn run(
        &self,
        request: &ClipRequest,
        cancel: &CancellationToken,
    ) -> Result<ClipOutcome, ClipError> {
        self.run_with_report(request, cancel).await.0
    }

    /// [`run`](Self::run), also returning what cleanup removed.
    /// The report is empty when the request never got a slot.
    pub async fn run_with_report(
        &self,
        request: &ClipRequest,
        cancel: &CancellationToken,
    ) -> (Result<ClipOutcome, ClipError>, CleanupReport) {
        let timeout = self.settings.request_timeout;
        let deadline = Instant::now() + timeout;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (Err(ClipError::Cancelled), CleanupReport::default()),
            permit = timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return (Err(ClipError::Cancelled), CleanupReport::default()),
                Err(_) => {
                    tracing::error!(timeout_secs = timeout.as_secs(), "request timed out waiting for a slot");
                    return (Err(ClipError::RequestTimeout(timeout)), CleanupReport::default());
                }
            },
        };

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(
            job_id = %job_id,
            stage = %PipelineStage::Validated,
            url = %request.source_url,
            start = request.start_seconds,
            end = request.end_seconds,
            "pipeline admitted"
        );

        let mut cleanup = Cleanup::new();
        cleanup.sweep_job(&self.settings.temp_dir, &job_id);

        let job_cancel = cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClipError::Cancelled),
            result = timeout_at(deadline, self.execute(request, &job_id, &mut cleanup, &job_cancel)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(ClipError::RequestTimeout(timeout)),
                }
            }
        };
        // Anything still running for this job is stopped before its files are removed
        job_cancel.cancel();

        if let Err(e) = &result {
            tracing::error!(job_id = %job_id, stage = %PipelineStage::Errored, error = %e, "pipeline failed");
        }

        tracing::debug!(job_id = %job_id, stage = %PipelineStage::CleaningUp, "removing temporary files");
        let report = cleanup.run().await;
        if report.failures > 0 {
            tracing::warn!(job_id = %job_id, failures = report.failures, "cleanup incomplete");
        }

        if let Ok(outcome) = &result {
            tracing::info!(
                job_id = %job_id,
                stage = %PipelineStage::Completed,
                storage_path = %outcome.storage_path,
                removed = report.removed,
                "clip published"
            );
        }
        (result, report)
    }

    async fn execute(
        &self,
        request: &ClipRequest,
        job_id: &str,
        cleanup: &mut Cleanup,
        cancel: &CancellationToken,
    ) -> Result<ClipOutcome, ClipError> {
        fs_err::tokio::create_dir_all(&self.settings.temp_dir).await?;

        tracing::info!(job_id, stage = %PipelineStage::Acquiring, "acquiring source audio");
        let media = self
            .acquirer
            .acquire(&request.source_url, job_id, cancel)
            .await?;
        cleanup.register(&media.path);

        let duration_seconds = request.duration_seconds();
        let output = self
            .settings
            .temp_dir
            .join(format!("{}-clip.{}", job_id, CLIP_EXTENSION));
        cleanup.register(&output);

        tracing::info!(job_id, stage = %PipelineStage::Trimming, duration_seconds, "trimming clip");
        let clip = self
            .trimmer
            .trim(&media.path, &output, request.start_seconds, duration_seconds, cancel)
            .await?;

        let destination = destination_path(&self.settings.key_prefix, &clip.path);
        tracing::info!(job_id, stage = %PipelineStage::Publishing, destination = %destination, "publishing clip");
        let published = self
            .publisher
            .publish(&self.settings.bucket, &destination, &clip.path)
            .await?;

        Ok(ClipOutcome {
            job_id: job_id.to_string(),
            public_url: published.public_url,
            storage_path: published.storage_path,
            duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::{AcquireError, AcquiredMedia};
    use crate::storage::{MockPublisher, PublishError, PublishResult};
    use crate::trim::{TranscodeError, TrimmedClip};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `<job>.m4a` into the temp dir
    struct FileAcquirer {
        dir: PathBuf,
    }

    #[async_trait]
    impl Acquire for FileAcquirer {
        async fn acquire(
            &self,
            _url: &str,
            job_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<AcquiredMedia, AcquireError> {
            let path = self.dir.join(format!("{job_id}.m4a"));
            std::fs::write(&path, b"full track")?;
            Ok(AcquiredMedia {
                path,
                extension: "m4a".to_string(),
            })
        }
    }

    /// Leaves a partial download behind and never finishes
    struct HangingAcquirer {
        dir: PathBuf,
    }

    #[async_trait]
    impl Acquire for HangingAcquirer {
        async fn acquire(
            &self,
            _url: &str,
            job_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<AcquiredMedia, AcquireError> {
            std::fs::write(self.dir.join(format!("{job_id}.webm.part")), b"partial")?;
            std::future::pending().await
        }
    }

    /// Counts entries and holds each acquisition until the gate hands out a permit
    struct GatedAcquirer {
        inner: FileAcquirer,
        started: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl Acquire for GatedAcquirer {
        async fn acquire(
            &self,
            url: &str,
            job_id: &str,
            cancel: &CancellationToken,
        ) -> Result<AcquiredMedia, AcquireError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|_| AcquireError::Cancelled)?
                .forget();
            self.inner.acquire(url, job_id, cancel).await
        }
    }

    struct CopyTrimmer;

    #[async_trait]
    impl Trim for CopyTrimmer {
        async fn trim(
            &self,
            input: &Path,
            output: &Path,
            _start_seconds: f64,
            _duration_seconds: f64,
            _cancel: &CancellationToken,
        ) -> Result<TrimmedClip, TranscodeError> {
            std::fs::copy(input, output).map_err(|e| TranscodeError(e.to_string()))?;
            Ok(TrimmedClip {
                path: output.to_path_buf(),
            })
        }
    }

    fn accepting_publisher(times: usize) -> MockPublisher {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(times)
            .returning(|bucket, destination, file| {
                assert_eq!(bucket, "audio");
                assert!(file.exists());
                Ok(PublishResult {
                    public_url: format!("https://cdn.example/audio/{destination}"),
                    storage_path: destination.to_string(),
                })
            });
        publisher
    }

    fn pipeline(
        dir: &Path,
        acquirer: Arc<dyn Acquire>,
        publisher: MockPublisher,
        concurrency: usize,
    ) -> ClipPipeline {
        ClipPipeline::new(
            acquirer,
            Arc::new(CopyTrimmer),
            Arc::new(publisher),
            concurrency,
            PipelineSettings {
                temp_dir: dir.to_path_buf(),
                bucket: "audio".to_string(),
                key_prefix: "performances".to_string(),
                request_timeout: Duration::from_secs(300),
            },
        )
    }

    fn request() -> ClipRequest {
        ClipRequest::parse("https://youtu.be/abc", "0:10", "0:40").unwrap()
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_success_publishes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(FileAcquirer {
            dir: dir.path().to_path_buf(),
        });
        let pipeline = pipeline(dir.path(), acquirer, accepting_publisher(1), 2);

        let (result, report) = pipeline
            .run_with_report(&request(), &CancellationToken::new())
            .await;
        let outcome = result.unwrap();

        // Source track and trimmed clip, each removed once
        assert_eq!(
            report,
            CleanupReport {
                removed: 2,
                failures: 0
            }
        );
        assert_eq!(outcome.duration_seconds, 30.0);
        assert!(outcome.storage_path.starts_with("performances/"));
        assert!(outcome
            .storage_path
            .ends_with(&format!("{}-clip.mp3", outcome.job_id)));
        assert_eq!(file_count(dir.path()), 0);
        assert_eq!(pipeline.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_publish_error_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(FileAcquirer {
            dir: dir.path().to_path_buf(),
        });
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, destination, _| Err(PublishError::Conflict(destination.to_string())));
        let pipeline = pipeline(dir.path(), acquirer, publisher, 2);

        let (result, report) = pipeline
            .run_with_report(&request(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result.unwrap_err(),
            ClipError::Publish(PublishError::Conflict(_))
        ));
        assert_eq!(report.removed, 2);
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_sweeps_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(HangingAcquirer {
            dir: dir.path().to_path_buf(),
        });
        let pipeline = pipeline(dir.path(), acquirer, MockPublisher::new(), 2);

        let started = Instant::now();
        let (result, report) = pipeline
            .run_with_report(&request(), &CancellationToken::new())
            .await;

        assert!(matches!(result.unwrap_err(), ClipError::RequestTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(300));
        // Only the prefix sweep knows about the partial download
        assert_eq!(report.removed, 1);
        assert_eq!(file_count(dir.path()), 0);
        assert_eq!(pipeline.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_admission() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(FileAcquirer {
            dir: dir.path().to_path_buf(),
        });
        let pipeline = pipeline(dir.path(), acquirer, MockPublisher::new(), 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, report) = pipeline.run_with_report(&request(), &cancel).await;
        assert!(matches!(result.unwrap_err(), ClipError::Cancelled));
        assert_eq!(report, CleanupReport::default());
    }

    #[test]
    fn test_outcome_reports_whole_seconds_as_integer() {
        let outcome = ClipOutcome {
            job_id: "abc".to_string(),
            public_url: "https://cdn.example/audio/performances/x/abc-clip.mp3".to_string(),
            storage_path: "performances/x/abc-clip.mp3".to_string(),
            duration_seconds: 30.0,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["durationSeconds"], serde_json::json!(30));
        assert_eq!(json["jobId"], "abc");
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..500 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("counter never reached {expected}");
    }

    #[tokio::test]
    async fn test_third_request_waits_for_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = Arc::new(GatedAcquirer {
            inner: FileAcquirer {
                dir: dir.path().to_path_buf(),
            },
            started: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let pipeline = Arc::new(pipeline(
            dir.path(),
            Arc::clone(&acquirer) as Arc<dyn Acquire>,
            accepting_publisher(3),
            2,
        ));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move { pipeline.run(&request(), &CancellationToken::new()).await })
            })
            .collect();

        wait_for(&acquirer.started, 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(acquirer.started.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.available_slots(), 0);

        acquirer.gate.add_permits(1);
        wait_for(&acquirer.started, 3).await;

        acquirer.gate.add_permits(2);
        for handle in handles {
            tokio_test::assert_ok!(handle.await.unwrap());
        }
        assert_eq!(file_count(dir.path()), 0);
    }
}
