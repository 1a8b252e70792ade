//! Match-state payload and the engineered features derived from it.
//!
//! The trained model consumes a fixed 16-column row: the three categorical
//! match descriptors, the six raw chase numbers, and seven derived features.
//! Column names follow the training data (`total_runs_x`, `crr`, `rrr`), not
//! the API field names.

use serde::{Deserialize, Serialize};

/// Balls remaining at or below which a lost wicket weighs more heavily.
pub const DEATH_OVERS_BALLS: f64 = 24.0;
/// Wicket weight multiplier inside the death overs.
pub const DEATH_OVER_MULTIPLIER: f64 = 1.5;

pub const CATEGORICAL_COLUMNS: [&str; 3] = ["batting_team", "bowling_team", "venue"];

pub const NUMERIC_COLUMNS: [&str; 13] = [
    "runs_left",
    "balls_left",
    "wickets_left",
    "total_runs_x",
    "crr",
    "rrr",
    "run_rate_ratio",
    "pressure_index",
    "wicket_impact",
    "runs_per_ball",
    "required_boundaries",
    "overs_remaining",
    "run_rate_diff",
];

/// Full column order of a [`FeatureRow`]. Any artifact must list exactly these.
pub const FEATURE_COLUMNS: [&str; 16] = [
    "batting_team",
    "bowling_team",
    "venue",
    "runs_left",
    "balls_left",
    "wickets_left",
    "total_runs_x",
    "crr",
    "rrr",
    "run_rate_ratio",
    "pressure_index",
    "wicket_impact",
    "runs_per_ball",
    "required_boundaries",
    "overs_remaining",
    "run_rate_diff",
];

/// State of a second-innings chase as posted by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchState {
    pub batting_team: String,
    pub bowling_team: String,
    pub venue: String,
    pub runs_left: f64,
    pub balls_left: f64,
    pub wickets_left: f64,
    #[serde(alias = "total_runs_x")]
    pub target_runs: f64,
    #[serde(alias = "crr")]
    pub current_run_rate: f64,
    #[serde(alias = "rrr")]
    pub required_run_rate: f64,
}

impl MatchState {
    /// Domain checks that the JSON shape alone cannot express.
    ///
    /// Returns every problem found, joined into one detail string.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();

        for (field, value) in [
            ("batting_team", &self.batting_team),
            ("bowling_team", &self.bowling_team),
            ("venue", &self.venue),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{field}: must not be empty"));
            }
        }

        for (field, value) in [
            ("runs_left", self.runs_left),
            ("balls_left", self.balls_left),
            ("wickets_left", self.wickets_left),
            ("target_runs", self.target_runs),
            ("current_run_rate", self.current_run_rate),
            ("required_run_rate", self.required_run_rate),
        ] {
            if !value.is_finite() {
                problems.push(format!("{field}: must be a finite number"));
            } else if value < 0.0 {
                problems.push(format!("{field}: must be non-negative, got {value}"));
            }
        }

        if self.wickets_left > 10.0 {
            problems.push(format!(
                "wickets_left: must be at most 10, got {}",
                self.wickets_left
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// Closed-form features computed per request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedFeatures {
    pub run_rate_ratio: f64,
    pub pressure_index: f64,
    pub wicket_impact: f64,
    pub runs_per_ball: f64,
    pub required_boundaries: f64,
    pub overs_remaining: f64,
    pub run_rate_diff: f64,
}

/// `1.5` inside the last four overs (`balls_left <= 24`), `1.0` before.
pub fn death_over_impact(balls_left: f64) -> f64 {
    if balls_left <= DEATH_OVERS_BALLS {
        DEATH_OVER_MULTIPLIER
    } else {
        1.0
    }
}

pub fn derive_features(state: &MatchState) -> DerivedFeatures {
    let crr = state.current_run_rate;
    let rrr = state.required_run_rate;

    let run_rate_ratio = if rrr != 0.0 { crr / rrr } else { 0.0 };
    let runs_per_ball = if state.balls_left != 0.0 {
        state.runs_left / state.balls_left
    } else {
        0.0
    };

    DerivedFeatures {
        run_rate_ratio,
        // wickets_left >= 0, so the denominator is at least 1
        pressure_index: (state.runs_left * rrr) / (state.wickets_left + 1.0),
        wicket_impact: (10.0 - state.wickets_left) * death_over_impact(state.balls_left),
        runs_per_ball,
        required_boundaries: state.runs_left / 4.0,
        overs_remaining: state.balls_left / 6.0,
        run_rate_diff: crr - rrr,
    }
}

/// One model input row, laid out in [`FEATURE_COLUMNS`] order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub categorical: [String; 3],
    pub numeric: [f64; 13],
}

impl FeatureRow {
    pub fn new(state: &MatchState, derived: &DerivedFeatures) -> Self {
        FeatureRow {
            categorical: [
                state.batting_team.clone(),
                state.bowling_team.clone(),
                state.venue.clone(),
            ],
            numeric: [
                state.runs_left,
                state.balls_left,
                state.wickets_left,
                state.target_runs,
                state.current_run_rate,
                state.required_run_rate,
                derived.run_rate_ratio,
                derived.pressure_index,
                derived.wicket_impact,
                derived.runs_per_ball,
                derived.required_boundaries,
                derived.overs_remaining,
                derived.run_rate_diff,
            ],
        }
    }

    #[allow(dead_code)]
    pub fn from_match(state: &MatchState) -> Self {
        Self::new(state, &derive_features(state))
    }
}

#[cfg(test)]
pub(crate) fn sample_state() -> MatchState {
    MatchState {
        batting_team: "A".into(),
        bowling_team: "B".into(),
        venue: "X".into(),
        runs_left: 50.0,
        balls_left: 30.0,
        wickets_left: 5.0,
        target_runs: 150.0,
        current_run_rate: 8.5,
        required_run_rate: 10.0,
    }
}
