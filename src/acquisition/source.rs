use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

use crate::error::AcquireError;

/// Outcome classes of a single fetch attempt; drives the retry loop.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Credentials or location rejected; retrying cannot help.
    #[error("{0}")]
    Configuration(String),

    /// Network hiccup, timeout, throttling or server-side failure.
    #[error("{0}")]
    Transient(String),

    /// The source answered, but not with the file.
    #[error("{0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Map a non-success HTTP status to a fetch outcome.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let msg = format!("HTTP {status}: {snippet}");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                FetchError::Configuration(format!("credentials rejected ({msg})"))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FetchError::Transient(msg),
            s if s.is_server_error() => FetchError::Transient(msg),
            _ => FetchError::Fatal(msg),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            FetchError::Configuration(format!("invalid request: {e}"))
        } else {
            FetchError::Transient(format!("request failed: {e}"))
        }
    }
}

/// A remote location the model artifact can be downloaded from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Download the raw artifact bytes. One attempt, no retries.
    async fn fetch(&self) -> Result<Vec<u8>, FetchError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, AcquireError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AcquireError::Configuration(format!("Failed to build HTTP client: {e}")))
}
