//! The serialized win-probability model.
//!
//! The artifact is a JSON document describing a fitted logistic pipeline:
//!
//! ```text
//!  FeatureRow ──┬─ categorical ─▶ one-hot (per-column vocabulary, unknown → all zeros)
//!               └─ numeric ─────▶ (x − mean) / scale
//!                                   │
//!                                   ▼
//!              z = intercept + Σ coefficient · x   →   p(batting win) = σ(z)
//! ```
//!
//! The column list is stored in the artifact and must equal
//! [`FEATURE_COLUMNS`]; anything else is rejected at load time rather than
//! scored against the wrong layout.

use serde::{Deserialize, Serialize};

use super::features::{FeatureRow, CATEGORICAL_COLUMNS, FEATURE_COLUMNS, NUMERIC_COLUMNS};
use crate::error::{AcquireError, InferenceError};

/// Feature schema revision this build scores against.
pub const SCHEMA_VERSION: u32 = 1;

/// Tolerance on `p0 + p1 == 1`.
const SUM_TOLERANCE: f64 = 1e-6;

/// Anything that turns a feature row into `[p(bowling win), p(batting win)]`.
pub trait Estimator: Send + Sync {
    fn predict_proba(&self, row: &FeatureRow) -> Result<[f64; 2], InferenceError>;
}

/// Vocabulary of one categorical column, in one-hot slot order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryEncoder {
    pub column: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticPipeline {
    pub schema_version: u32,
    pub columns: Vec<String>,
    pub encoders: Vec<CategoryEncoder>,
    pub scaler: StandardScaler,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LogisticPipeline {
    /// Parse and structurally validate artifact bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AcquireError> {
        let model: LogisticPipeline = serde_json::from_slice(bytes)
            .map_err(|e| AcquireError::CorruptArtifact(format!("not a model document: {e}")))?;
        model.validate().map_err(AcquireError::CorruptArtifact)?;
        Ok(model)
    }

    #[allow(dead_code)]
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Width of the encoded design vector.
    pub fn input_width(&self) -> usize {
        self.encoders
            .iter()
            .map(|e| e.categories.len())
            .sum::<usize>()
            + NUMERIC_COLUMNS.len()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is not supported (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.columns.iter().map(String::as_str).ne(FEATURE_COLUMNS.iter().copied()) {
            return Err(format!(
                "column layout {:?} does not match expected {:?}",
                self.columns, FEATURE_COLUMNS
            ));
        }
        if self.encoders.len() != CATEGORICAL_COLUMNS.len() {
            return Err(format!(
                "expected {} categorical encoders, found {}",
                CATEGORICAL_COLUMNS.len(),
                self.encoders.len()
            ));
        }
        for (encoder, expected) in self.encoders.iter().zip(CATEGORICAL_COLUMNS) {
            if encoder.column != expected {
                return Err(format!(
                    "encoder for '{}' found where '{}' was expected",
                    encoder.column, expected
                ));
            }
        }
        if self.scaler.mean.len() != NUMERIC_COLUMNS.len()
            || self.scaler.scale.len() != NUMERIC_COLUMNS.len()
        {
            return Err(format!(
                "scaler must cover {} numeric columns (mean={}, scale={})",
                NUMERIC_COLUMNS.len(),
                self.scaler.mean.len(),
                self.scaler.scale.len()
            ));
        }
        if let Some(i) = self
            .scaler
            .scale
            .iter()
            .position(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(format!(
                "scale for '{}' must be positive and finite",
                NUMERIC_COLUMNS[i]
            ));
        }
        if self.coefficients.len() != self.input_width() {
            return Err(format!(
                "{} coefficients for an input width of {}",
                self.coefficients.len(),
                self.input_width()
            ));
        }
        let all_finite = self
            .scaler
            .mean
            .iter()
            .chain(self.coefficients.iter())
            .chain(std::iter::once(&self.intercept))
            .all(|v| v.is_finite());
        if !all_finite {
            return Err("parameters contain NaN or infinite values".to_string());
        }
        Ok(())
    }

    fn decision_function(&self, row: &FeatureRow) -> f64 {
        let mut z = self.intercept;
        let mut offset = 0;

        for (encoder, value) in self.encoders.iter().zip(row.categorical.iter()) {
            // Unseen categories contribute nothing.
            if let Some(slot) = encoder.categories.iter().position(|c| c == value) {
                z += self.coefficients[offset + slot];
            }
            offset += encoder.categories.len();
        }

        for (i, x) in row.numeric.iter().enumerate() {
            let scaled = (x - self.scaler.mean[i]) / self.scaler.scale[i];
            z += self.coefficients[offset + i] * scaled;
        }
        z
    }
}

impl Estimator for LogisticPipeline {
    fn predict_proba(&self, row: &FeatureRow) -> Result<[f64; 2], InferenceError> {
        let z = self.decision_function(row);
        if z.is_nan() {
            return Err(InferenceError::Evaluation(
                "decision function evaluated to NaN".to_string(),
            ));
        }
        let batting = sigmoid(z);
        Ok([1.0 - batting, batting])
    }
}

/// Check a raw `[p(bowling), p(batting)]` pair before it leaves the service.
///
/// Out-of-range or non-normalised output means the artifact and the feature
/// schema disagree; it is reported, never clamped.
pub fn check_probabilities(proba: [f64; 2]) -> Result<[f64; 2], InferenceError> {
    let [bowling, batting] = proba;
    let in_range = (0.0..=1.0).contains(&bowling) && (0.0..=1.0).contains(&batting);
    if !in_range || ((bowling + batting) - 1.0).abs() > SUM_TOLERANCE {
        return Err(InferenceError::InvalidProbabilities { bowling, batting });
    }
    Ok(proba)
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Small, valid artifact: known teams/venue, zero numeric weights unless set.
#[cfg(test)]
pub(crate) fn test_pipeline(intercept: f64) -> LogisticPipeline {
    let encoders = vec![
        CategoryEncoder {
            column: "batting_team".into(),
            categories: vec!["A".into(), "B".into()],
        },
        CategoryEncoder {
            column: "bowling_team".into(),
            categories: vec!["A".into(), "B".into()],
        },
        CategoryEncoder {
            column: "venue".into(),
            categories: vec!["X".into()],
        },
    ];
    let width = 5 + NUMERIC_COLUMNS.len();
    LogisticPipeline {
        schema_version: SCHEMA_VERSION,
        columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        encoders,
        scaler: StandardScaler {
            mean: vec![0.0; NUMERIC_COLUMNS.len()],
            scale: vec![1.0; NUMERIC_COLUMNS.len()],
        },
        coefficients: vec![0.0; width],
        intercept,
    }
}

#[cfg(test)]
pub(crate) fn test_artifact_bytes(intercept: f64) -> Vec<u8> {
    test_pipeline(intercept).to_vec().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::features::sample_state;
    use approx::assert_relative_eq;

    #[test]
    fn test_intercept_only_model_reproduces_odds() {
        let model = test_pipeline((0.7f64 / 0.3).ln());
        let p = model.predict_proba(&FeatureRow::from_match(&sample_state())).unwrap();
        assert_relative_eq!(p[1], 0.7, epsilon = 1e-12);
        assert_relative_eq!(p[0], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_one_hot_and_scaling_contribute() {
        let mut model = test_pipeline(0.0);
        // batting_team == "A" is slot 0
        model.coefficients[0] = 1.0;
        // runs_left is the first numeric column, after 5 one-hot slots
        model.scaler.mean[0] = 40.0;
        model.scaler.scale[0] = 10.0;
        model.coefficients[5] = -1.0;

        // z = 1.0 + (-1.0 * (50 - 40) / 10) = 0
        let p = model.predict_proba(&FeatureRow::from_match(&sample_state())).unwrap();
        assert_relative_eq!(p[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_category_is_ignored() {
        let mut model = test_pipeline(0.0);
        model.coefficients[4] = 3.0; // venue == "X"
        let mut state = sample_state();
        state.venue = "Eden Gardens".into();
        let p = model.predict_proba(&FeatureRow::from_match(&state)).unwrap();
        assert_relative_eq!(p[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_extreme_logits_stay_in_range() {
        for z in [-800.0, 800.0] {
            let p = test_pipeline(z)
                .predict_proba(&FeatureRow::from_match(&sample_state()))
                .unwrap();
            assert!(check_probabilities(p).is_ok(), "z={z} gave {p:?}");
        }
    }

    #[test]
    fn test_from_slice_accepts_valid_artifact() {
        let model = LogisticPipeline::from_slice(&test_artifact_bytes(0.2)).unwrap();
        assert_eq!(model.input_width(), 18);
        assert_eq!(model.intercept, 0.2);
    }

    #[test]
    fn test_from_slice_rejects_garbage() {
        let err = LogisticPipeline::from_slice(b"\x80\x04\x95pickle").unwrap_err();
        assert!(matches!(err, AcquireError::CorruptArtifact(_)));
    }

    #[test]
    fn test_rejects_raw_six_column_schema() {
        let mut model = test_pipeline(0.0);
        model.columns = [
            "current_score",
            "balls_left",
            "wickets_left",
            "last_five",
            "city",
            "batting_team",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        let bytes = model.to_vec().unwrap();
        match LogisticPipeline::from_slice(&bytes) {
            Err(AcquireError::CorruptArtifact(reason)) => assert!(reason.contains("column layout")),
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_reordered_columns() {
        let mut model = test_pipeline(0.0);
        model.columns.swap(3, 4);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_rejects_dimension_mismatch() {
        let mut model = test_pipeline(0.0);
        model.coefficients.pop();
        assert!(model.validate().unwrap_err().contains("coefficients"));

        let mut model = test_pipeline(0.0);
        model.scaler.scale[2] = 0.0;
        assert!(model.validate().unwrap_err().contains("wickets_left"));

        let mut model = test_pipeline(0.0);
        model.schema_version = 2;
        assert!(model.validate().unwrap_err().contains("schema version"));
    }

    #[test]
    fn test_check_probabilities() {
        assert!(check_probabilities([0.3, 0.7]).is_ok());
        assert!(check_probabilities([0.0, 1.0]).is_ok());
        assert!(check_probabilities([-0.2, 1.2]).is_err());
        assert!(check_probabilities([0.5, 0.6]).is_err());
        assert!(check_probabilities([f64::NAN, 0.5]).is_err());
    }
}
