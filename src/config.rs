use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::{ArtifactSource, BlobStoreSource, RetryPolicy, SharedLinkSource};
use crate::error::AcquireError;

/// Cricket chase win-probability API
#[derive(Parser, Debug, Clone)]
#[command(name = "ipl-win-predictor", version, about)]
pub struct Config {
    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Browser origins allowed to call the API (comma-separated, `*` for any)
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// Local cache location of the model artifact
    #[arg(long, env = "MODEL_PATH", default_value = "model.json")]
    pub model_path: PathBuf,

    /// Azure Storage connection string (selects the blob-store source)
    #[arg(long, env = "AZURE_STORAGE_CONNECTION_STRING", hide_env_values = true)]
    pub azure_storage_connection_string: Option<String>,

    /// Blob container holding the model
    #[arg(long, env = "AZURE_CONTAINER_NAME", default_value = "model")]
    pub azure_container_name: String,

    /// Blob name of the model
    #[arg(long, env = "MODEL_BLOB_NAME", default_value = "ipl_prediction_model.json")]
    pub model_blob_name: String,

    /// Shared file link or file id (used when no connection string is set)
    #[arg(long, env = "MODEL_SHARE_URL")]
    pub model_share_url: Option<String>,

    /// Download attempts before giving up
    #[arg(long, env = "DOWNLOAD_MAX_ATTEMPTS", default_value = "5")]
    pub download_max_attempts: u32,

    /// Initial retry delay in milliseconds (doubles per attempt)
    #[arg(long, env = "DOWNLOAD_BASE_DELAY_MS", default_value = "1000")]
    pub download_base_delay_ms: u64,

    /// Per-request HTTP timeout for downloads, in seconds
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value = "60")]
    pub download_timeout_secs: u64,

    /// Load the model before accepting traffic (startup fails if it cannot)
    #[arg(
        long,
        env = "EAGER_LOAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub eager_load: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.download_max_attempts == 0 {
            anyhow::bail!("download_max_attempts must be at least 1");
        }
        if self.download_timeout_secs == 0 {
            anyhow::bail!("download_timeout_secs must be at least 1");
        }
        let origins: Vec<&str> = self
            .allowed_origins
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .collect();
        if origins.is_empty() {
            anyhow::bail!("at least one allowed origin is required");
        }
        for origin in origins {
            if origin != "*" && !(origin.starts_with("http://") || origin.starts_with("https://")) {
                anyhow::bail!("allowed origin '{}' must start with http:// or https://", origin);
            }
        }
        if self.model_path.as_os_str().is_empty() {
            anyhow::bail!("model_path must not be empty");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.download_max_attempts,
            base_delay: Duration::from_millis(self.download_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    /// Origins with blanks removed.
    pub fn origins(&self) -> Vec<String> {
        self.allowed_origins
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }

    /// Pick the remote source: blob store first, then a shared link, else none.
    pub fn build_source(&self) -> Result<Option<Arc<dyn ArtifactSource>>, AcquireError> {
        let timeout = Duration::from_secs(self.download_timeout_secs);
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if let Some(cs) = non_blank(&self.azure_storage_connection_string) {
            let source = BlobStoreSource::new(
                &cs,
                &self.azure_container_name,
                &self.model_blob_name,
                timeout,
            )?;
            return Ok(Some(Arc::new(source)));
        }
        if let Some(link) = non_blank(&self.model_share_url) {
            return Ok(Some(Arc::new(SharedLinkSource::new(&link, timeout)?)));
        }
        Ok(None)
    }
}
