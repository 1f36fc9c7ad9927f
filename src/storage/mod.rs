//! Publishing trimmed clips to S3-compatible object storage.

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use serde::Serialize;
use std::path::Path;

use crate::config::StorageConfig;
use crate::trim::CLIP_CONTENT_TYPE;

/// Where a published clip ended up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishResult {
    pub public_url: String,
    pub storage_path: String,
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("object already exists: {0}")]
    Conflict(String),

    #[error("upload failed: {0}")]
    Transport(String),
}

/// Uploads a local file to durable storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload `file` to `destination` in `bucket` without overwriting anything
    async fn publish(
        &self,
        bucket: &str,
        destination: &str,
        file: &Path,
    ) -> Result<PublishResult, PublishError>;
}

/// Publisher backed by the AWS S3 SDK
#[derive(Clone)]
pub struct S3Publisher {
    client: S3Client,
    public_url_base: String,
}

impl S3Publisher {
    /// Build the client once at startup; missing endpoint or credentials are an error here
    pub async fn new(config: &StorageConfig) -> crate::Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .context("STORAGE_ENDPOINT (or SUPABASE_URL) must be configured")?;
        let access_key_id = config
            .access_key_id
            .as_deref()
            .context("STORAGE_ACCESS_KEY_ID must be configured")?;
        let secret_access_key = config
            .secret_access_key
            .as_deref()
            .context("STORAGE_SECRET_ACCESS_KEY must be configured")?;

        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "ytclip");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let public_url_base = config
            .public_url_base
            .clone()
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket));

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            public_url_base,
        })
    }

    /// Check if an object exists
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, PublishError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(PublishError::Transport(format!(
                "cannot check {}: {}",
                key,
                aws_sdk_s3::error::DisplayErrorContext(&e)
            ))),
        }
    }
}

#[async_trait]
impl Publisher for S3Publisher {
    async fn publish(
        &self,
        bucket: &str,
        destination: &str,
        file: &Path,
    ) -> Result<PublishResult, PublishError> {
        if self.exists(bucket, destination).await? {
            return Err(PublishError::Conflict(destination.to_string()));
        }

        tracing::info!("Uploading clip to s3://{}/{}", bucket, destination);

        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| PublishError::Transport(format!("cannot read {}: {}", file.display(), e)))?;

        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(destination)
            .body(body)
            .content_type(CLIP_CONTENT_TYPE)
            // Never replace an object that appeared after the existence check
            .if_none_match("*")
            .send()
            .await;

        if let Err(e) = result {
            let code = e.as_service_error().and_then(|se| se.code());
            if matches!(code, Some("PreconditionFailed") | Some("ConditionalRequestConflict")) {
                return Err(PublishError::Conflict(destination.to_string()));
            }
            return Err(PublishError::Transport(
                aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
            ));
        }

        Ok(PublishResult {
            public_url: public_url(&self.public_url_base, destination),
            storage_path: destination.to_string(),
        })
    }
}

/// Join a public base URL and an object key, encoding each key segment
pub fn public_url(base: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", base.trim_end_matches('/'), encoded.join("/"))
}

/// Object key for a clip: `<prefix>/<uuid>/<file name>`
pub fn destination_path(prefix: &str, file: &Path) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip.mp3".to_string());
    let prefix = prefix.trim_matches('/');
    let folder = uuid::Uuid::new_v4();

    if prefix.is_empty() {
        format!("{}/{}", folder, name)
    } else {
        format!("{}/{}/{}", prefix, folder, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://cdn.example/audio/", "performances/abc/clip 1.mp3"),
            "https://cdn.example/audio/performances/abc/clip%201.mp3"
        );
    }

    #[test]
    fn test_destination_path() {
        let path = destination_path("performances", Path::new("/tmp/x/job-clip.mp3"));
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "performances");
        assert!(uuid::Uuid::parse_str(parts[1]).is_ok());
        assert_eq!(parts[2], "job-clip.mp3");

        let bare = destination_path("", Path::new("a.mp3"));
        assert_eq!(bare.split('/').count(), 2);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_fast() {
        let config = StorageConfig {
            endpoint: Some("https://s3.example".to_string()),
            ..StorageConfig::default()
        };
        let err = S3Publisher::new(&config).await.err().unwrap();
        assert!(err.to_string().contains("STORAGE_ACCESS_KEY_ID"));

        let err = S3Publisher::new(&StorageConfig::default()).await.err().unwrap();
        assert!(err.to_string().contains("STORAGE_ENDPOINT"));
    }

    #[tokio::test]
    async fn test_builds_with_full_config() {
        let config = StorageConfig {
            endpoint: Some("https://s3.example/".to_string()),
            access_key_id: Some("id".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..StorageConfig::default()
        };
        let publisher = S3Publisher::new(&config).await.unwrap();
        assert_eq!(publisher.public_url_base, "https://s3.example/audio");
    }
}
