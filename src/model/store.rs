use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use super::Estimator;
use crate::acquisition::{acquire_artifact, ArtifactSource, RetryPolicy};
use crate::error::AcquireError;

/// Owns the process-wide model and the one-time transition to "loaded".
///
/// Concurrent first callers share a single acquisition. A failed acquisition
/// leaves the store empty, so the next caller tries again.
pub struct ModelStore {
    cache_path: PathBuf,
    source: Option<Arc<dyn ArtifactSource>>,
    retry: RetryPolicy,
    model: OnceCell<Arc<dyn Estimator>>,
}

impl ModelStore {
    pub fn new(
        cache_path: impl Into<PathBuf>,
        source: Option<Arc<dyn ArtifactSource>>,
        retry: RetryPolicy,
    ) -> Self {
        ModelStore {
            cache_path: cache_path.into(),
            source,
            retry,
            model: OnceCell::new(),
        }
    }

    /// A store that is already loaded with `estimator`.
    #[cfg(test)]
    pub fn preloaded(estimator: Arc<dyn Estimator>) -> Self {
        ModelStore {
            cache_path: PathBuf::new(),
            source: None,
            retry: RetryPolicy::default(),
            model: OnceCell::new_with(Some(estimator)),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Return the model, acquiring it first if this is the first successful call.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn Estimator>, AcquireError> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let pipeline =
                    acquire_artifact(&self.cache_path, self.source.as_deref(), &self.retry)
                        .await?;
                info!(
                    "Model ready ({} coefficients, {} encoded inputs)",
                    pipeline.coefficients.len(),
                    pipeline.input_width()
                );
                Ok::<_, AcquireError>(Arc::new(pipeline) as Arc<dyn Estimator>)
            })
            .await?;
        Ok(Arc::clone(model))
    }
}
