pub mod features;
pub mod pipeline;
pub mod store;

pub use features::{derive_features, FeatureRow, MatchState};
pub use pipeline::{check_probabilities, Estimator, LogisticPipeline};
pub use store::ModelStore;
