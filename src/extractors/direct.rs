use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{redirect, Client};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::utils::format_file_size;

/// Streams a remote media URL straight to disk
#[derive(Clone)]
pub struct DirectFetcher {
    client: Client,
}

impl DirectFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(redirect::Policy::limited(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// On failure or cancellation whatever reached `dest` is removed.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let result = tokio::select! {
            result = self.stream_to_file(url, dest) => result,
            _ = cancel.cancelled() => Err(anyhow::anyhow!("download of {} cancelled", dest.display())),
        };

        if result.is_err() {
            discard_partial(dest).await;
        }
        result
    }

    async fn stream_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download audio: HTTP {}", response.status());
        }

        let mut file = fs_err::tokio::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(
            "Fetched {} into {}",
            format_file_size(written),
            dest.display()
        );

        Ok(written)
    }
}

/// Best-effort removal of a file a failed download left behind
pub(crate) async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove partial download"),
    }
}
