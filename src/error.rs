use thiserror::Error;

/// Failures while obtaining the model artifact (cache or remote).
#[derive(Error, Debug)]
pub enum AcquireError {
    /// Missing or unusable settings. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote source kept failing (or failed permanently).
    #[error("Model download failed after {attempts} attempt(s): {last_error}")]
    Download { attempts: u32, last_error: String },

    /// Bytes were fetched but do not form a usable model.
    #[error("Corrupt model artifact: {0}")]
    CorruptArtifact(String),

    #[error("Model cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while scoring a feature row.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Invalid probability values: bowling={bowling}, batting={batting}")]
    InvalidProbabilities { bowling: f64, batting: f64 },

    #[error("Model evaluation failed: {0}")]
    Evaluation(String),
}
