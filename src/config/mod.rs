use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest clip a request may ask for, in seconds
pub const MAX_SEGMENT_SECONDS: u64 = 60 * 10;

/// Deadline for a whole request, queueing included
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5 * 60 * 1000);

/// Total acquisition attempts, the first one included
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// Wait before the first acquisition retry; doubles for every further retry
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Object storage settings
    pub storage: StorageConfig,

    /// Download/trim pipeline settings
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Bearer key required on /extract
    pub service_api_key: Option<String>,

    /// Include internal error messages in 500 responses
    pub debug_errors: bool,

    /// Requests allowed per client per minute
    pub rate_limit_per_minute: u32,

    /// Key rate limits on `X-Forwarded-For`/`X-Real-IP` instead of the socket address.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy: bool,

    /// Maximum JSON body size in bytes
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint URL
    pub endpoint: Option<String>,

    pub access_key_id: Option<String>,

    pub secret_access_key: Option<String>,

    pub region: String,

    /// Bucket that receives published clips
    pub bucket: String,

    /// Base for public URLs; defaults to `<endpoint>/<bucket>`
    pub public_url_base: Option<String>,

    /// Key prefix for published clips
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Working directory for downloaded and trimmed files
    pub temp_dir: PathBuf,

    /// Number of pipelines allowed to run at once
    pub concurrency: usize,

    /// Wall-clock limit for acquiring the source audio
    #[serde(with = "duration_secs")]
    pub download_timeout: Duration,

    /// Deadline for a whole request
    #[serde(skip, default = "default_request_timeout")]
    pub request_timeout: Duration,

    pub yt_dlp_path: String,

    pub ffmpeg_path: String,

    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            service_api_key: None,
            debug_errors: false,
            rate_limit_per_minute: 30,
            trust_proxy: false,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            region: "us-east-1".to_string(),
            bucket: "audio".to_string(),
            public_url_base: None,
            key_prefix: "performances".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("tmp"),
            concurrency: 2,
            download_timeout: Duration::from_secs(120),
            request_timeout: REQUEST_TIMEOUT,
            yt_dlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36".to_string(),
        }
    }
}

fn default_request_timeout() -> Duration {
    REQUEST_TIMEOUT
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Config {
    /// Load configuration: defaults, then an optional YAML file, then environment variables
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) => {
                let content = fs_err::read_to_string(&path)
                    .context("Failed to read config file")?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                tracing::debug!("Loaded configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Locate a config file, if any exists
    fn config_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("YTCLIP_CONFIG") {
            return Some(PathBuf::from(explicit));
        }

        // Current directory first for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Some(local_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("ytclip").join("config.yaml"))
            .filter(|path| path.exists())
    }

    /// Overlay environment variables, looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port.parse().context("PORT must be a port number")?;
        }
        if let Some(key) = var("SERVICE_API_KEY").or_else(|| var("API_KEY")) {
            self.server.service_api_key = Some(key);
        }
        if var("LOG_LEVEL").is_some_and(|level| level.eq_ignore_ascii_case("debug")) {
            self.server.debug_errors = true;
        }
        if let Some(flag) = var("DEBUG_ERRORS") {
            self.server.debug_errors = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(limit) = var("RATE_LIMIT_PER_MINUTE") {
            self.server.rate_limit_per_minute = limit
                .parse()
                .context("RATE_LIMIT_PER_MINUTE must be a number")?;
        }
        if let Some(flag) = var("TRUST_PROXY") {
            self.server.trust_proxy = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        if let Some(endpoint) = var("STORAGE_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        } else if let Some(supabase) = var("SUPABASE_URL").or_else(|| var("NEXT_PUBLIC_SUPABASE_URL")) {
            let base = supabase.trim_end_matches('/');
            self.storage.endpoint = Some(format!("{base}/storage/v1/s3"));
            if self.storage.public_url_base.is_none() {
                self.storage.public_url_base = Some(format!(
                    "{base}/storage/v1/object/public/{}",
                    var("STORAGE_BUCKET").unwrap_or_else(|| self.storage.bucket.clone())
                ));
            }
        }
        if let Some(id) = var("STORAGE_ACCESS_KEY_ID") {
            self.storage.access_key_id = Some(id);
        }
        if let Some(secret) = var("STORAGE_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = Some(secret);
        }
        if let Some(region) = var("STORAGE_REGION") {
            self.storage.region = region;
        }
        if let Some(bucket) = var("STORAGE_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(base) = var("STORAGE_PUBLIC_URL") {
            self.storage.public_url_base = Some(base);
        }

        if let Some(dir) = var("TEMP_DIR") {
            self.pipeline.temp_dir = PathBuf::from(dir);
        }
        if let Some(cap) = var("CONCURRENCY") {
            self.pipeline.concurrency = cap.parse().context("CONCURRENCY must be a number")?;
        }
        if let Some(secs) = var("DOWNLOAD_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().context("DOWNLOAD_TIMEOUT_SECS must be a number")?;
            self.pipeline.download_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = var("YT_DLP_PATH") {
            self.pipeline.yt_dlp_path = path;
        }
        if let Some(path) = var("FFMPEG_PATH") {
            self.pipeline.ffmpeg_path = path;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.concurrency == 0 {
            anyhow::bail!("CONCURRENCY must be at least 1");
        }

        if self.pipeline.download_timeout.is_zero() {
            anyhow::bail!("DOWNLOAD_TIMEOUT_SECS must be at least 1");
        }

        if self.server.rate_limit_per_minute == 0 {
            anyhow::bail!("RATE_LIMIT_PER_MINUTE must be at least 1");
        }

        if self.storage.bucket.is_empty() {
            anyhow::bail!("STORAGE_BUCKET must not be empty");
        }

        Ok(())
    }

    /// Display current configuration with secrets masked
    pub fn display(&self) {
        let masked = |value: &Option<String>| match value {
            Some(_) => "********",
            None => "(not set)",
        };

        println!("Current Configuration:");
        println!("  Listen: {}:{}", self.server.host, self.server.port);
        println!("  API Key: {}", masked(&self.server.service_api_key));
        println!("  Debug Errors: {}", self.server.debug_errors);
        println!("  Rate Limit: {}/min", self.server.rate_limit_per_minute);
        println!("  Trust Proxy Headers: {}", self.server.trust_proxy);
        println!(
            "  Storage Endpoint: {}",
            self.storage.endpoint.as_deref().unwrap_or("(not set)")
        );
        println!("  Storage Access Key: {}", masked(&self.storage.access_key_id));
        println!("  Storage Bucket: {}", self.storage.bucket);
        if let Some(base) = &self.storage.public_url_base {
            println!("  Public URL Base: {}", base);
        }
        println!("  Temp Dir: {}", self.pipeline.temp_dir.display());
        println!("  Concurrency: {}", self.pipeline.concurrency);
        println!(
            "  Download Timeout: {}",
            crate::utils::format_duration(self.pipeline.download_timeout.as_secs_f64())
        );
        println!("  yt-dlp: {}", self.pipeline.yt_dlp_path);
        println!("  ffmpeg: {}", self.pipeline.ffmpeg_path);
    }
}
