use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Files a pipeline run created, removed once the run is over whatever its outcome
#[derive(Debug, Default)]
pub struct Cleanup {
    files: Vec<PathBuf>,
    /// `(dir, job_id)`: anything in `dir` whose name starts with `job_id`
    sweeps: Vec<(PathBuf, String)>,
}

/// What a cleanup pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failures: usize,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file; registering the same path twice removes it once
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    /// Also remove every file in `dir` named after `job_id`, partial downloads included
    pub fn sweep_job(&mut self, dir: &Path, job_id: &str) {
        self.sweeps.push((dir.to_path_buf(), job_id.to_string()));
    }

    /// Remove everything registered. Failures are logged, never returned.
    pub async fn run(self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut files = self.files;

        for (dir, job_id) in &self.sweeps {
            match job_files(dir, job_id).await {
                Ok(found) => {
                    for path in found {
                        if !files.contains(&path) {
                            files.push(path);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cleanup sweep failed");
                    report.failures += 1;
                }
            }
        }

        for path in &files {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "removed temporary file");
                    report.removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file");
                    report.failures += 1;
                }
            }
        }

        report
    }
}

async fn job_files(dir: &Path, job_id: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(job_id) {
            found.push(entry.path());
        }
    }

    Ok(found)
}
