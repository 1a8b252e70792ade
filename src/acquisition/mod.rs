//! Getting the model artifact onto local disk.
//!
//! ```text
//!  cache file present? ──yes──▶ parse + validate ──▶ model
//!        │ no                        │ invalid → delete file, CorruptArtifact
//!        ▼
//!  ArtifactSource::fetch()  (blob store | shared link)
//!        │  transient failure → sleep base·2^(n−1) (+jitter), retry up to max_attempts
//!        ▼
//!  parse + validate ──invalid──▶ CorruptArtifact (nothing written)
//!        │
//!        ▼
//!  write <cache>.part, rename onto <cache> ──▶ model
//! ```

pub mod blob;
pub mod shared_link;
pub mod source;

pub use blob::BlobStoreSource;
pub use shared_link::SharedLinkSource;
pub use source::{ArtifactSource, FetchError};

use rand::Rng;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::AcquireError;
use crate::model::LogisticPipeline;

/// Bounded exponential backoff for remote fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        delay + delay.mul_f64(jitter)
    }
}

/// Fetch from `source`, retrying transient failures per `policy`.
pub async fn fetch_with_retry(
    source: &dyn ArtifactSource,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, AcquireError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        info!(
            "[{}] Downloading model artifact (attempt {}/{})",
            source.name(),
            attempt,
            max_attempts
        );

        match source.fetch().await {
            Ok(bytes) => {
                info!("[{}] Downloaded {} bytes", source.name(), bytes.len());
                return Ok(bytes);
            }
            Err(FetchError::Configuration(msg)) => {
                error!("[{}] Configuration problem: {}", source.name(), msg);
                return Err(AcquireError::Configuration(msg));
            }
            Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                error!("[{}] Download failed on attempt {}: {}", source.name(), attempt, e);
                return Err(AcquireError::Download {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.jittered_delay(attempt);
                warn!(
                    "[{}] Attempt {} failed: {}. Retrying in {:?}...",
                    source.name(),
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Load the model from `cache_path`, downloading and caching it first if absent.
pub async fn acquire_artifact(
    cache_path: &Path,
    source: Option<&dyn ArtifactSource>,
    policy: &RetryPolicy,
) -> Result<LogisticPipeline, AcquireError> {
    if tokio::fs::try_exists(cache_path).await? {
        let bytes = tokio::fs::read(cache_path).await?;
        return match LogisticPipeline::from_slice(&bytes) {
            Ok(model) => {
                info!("Model loaded from cache {}", cache_path.display());
                Ok(model)
            }
            Err(e) => {
                warn!(
                    "Cached model {} is unusable ({}); removing it",
                    cache_path.display(),
                    e
                );
                tokio::fs::remove_file(cache_path).await?;
                Err(e)
            }
        };
    }

    let source = source.ok_or_else(|| {
        AcquireError::Configuration(format!(
            "no model at {} and no remote source configured \
             (set AZURE_STORAGE_CONNECTION_STRING or MODEL_SHARE_URL)",
            cache_path.display()
        ))
    })?;

    let bytes = fetch_with_retry(source, policy).await?;
    let model = LogisticPipeline::from_slice(&bytes).map_err(|e| {
        error!("[{}] Downloaded artifact rejected: {}", source.name(), e);
        e
    })?;

    write_cache(cache_path, &bytes).await?;
    info!("Model downloaded, verified and cached at {}", cache_path.display());
    Ok(model)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Write via a sibling temp file so a crash never leaves a truncated cache.
async fn write_cache(path: &Path, bytes: &[u8]) -> Result<(), AcquireError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = partial_path(path);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Fresh model path under the system temp dir; the directory does not exist yet.
#[cfg(test)]
pub(crate) fn scratch_model_path(label: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("ipl-win-{}-{:016x}", label, rand::random::<u64>()))
        .join("model.json")
}

/// Serve `router` on an ephemeral local port; returns its base URL.
#[cfg(test)]
pub(crate) async fn serve_locally(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
