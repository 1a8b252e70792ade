use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::error::{AcquireError, InferenceError};
use crate::model::{check_probabilities, derive_features, FeatureRow, MatchState, ModelStore};

#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelStore>,
}

/// Build the Axum router for the prediction API.
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .layer(cors)
        .with_state(Arc::new(state))
}

/// CORS for the configured browser origins; `*` allows any origin without credentials.
pub fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.iter().any(|o| o.trim() == "*") {
        return Ok(CorsLayer::permissive());
    }
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim()).with_context(|| format!("invalid CORS origin '{}'", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub batting_win: f64,
    pub bowling_win: f64,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub model_loaded: bool,
    pub timestamp: DateTime<Utc>,
}

/// Request-level failures, rendered as `{"detail": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] AcquireError),

    #[error("{0}")]
    Inference(#[from] InferenceError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ModelUnavailable(_) | ApiError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// GET /
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "IPL Prediction API is running" }))
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        model_loaded: state.models.is_loaded(),
        timestamp: Utc::now(),
    })
}

/// POST /predict
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MatchState>, JsonRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let Json(input) = payload.map_err(|rejection| {
        warn!("Rejected prediction payload: {}", rejection.body_text());
        ApiError::Validation(rejection.body_text())
    })?;
    if let Err(detail) = input.validate() {
        warn!("Invalid match state {:?}: {}", input, detail);
        return Err(ApiError::Validation(detail));
    }
    info!("Received prediction request: {:?}", input);

    let model = state.models.ensure_loaded().await.map_err(|e| {
        error!("Model load failed while serving prediction: {}", e);
        ApiError::from(e)
    })?;

    let derived = derive_features(&input);
    info!("Derived features: {:?}", derived);
    let row = FeatureRow::new(&input, &derived);

    let raw = model
        .predict_proba(&row)
        .and_then(check_probabilities)
        .map_err(|e| {
            error!("Prediction failed for {:?}: {}", row, e);
            ApiError::from(e)
        })?;
    info!("Raw prediction: {:?}", raw);

    let prediction = Prediction {
        batting_win: raw[1],
        bowling_win: raw[0],
    };
    info!(
        "Final probabilities - batting: {:.4}, bowling: {:.4}",
        prediction.batting_win, prediction.bowling_win
    );
    Ok(Json(prediction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{scratch_model_path, RetryPolicy};
    use crate::model::pipeline::test_artifact_bytes;
    use crate::model::Estimator;
    use approx::assert_relative_eq;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const LOCAL_UI: &str = "http://localhost:3000";

    struct FixedEstimator {
        proba: [f64; 2],
        calls: AtomicUsize,
    }

    impl Estimator for FixedEstimator {
        fn predict_proba(&self, _row: &FeatureRow) -> Result<[f64; 2], InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.proba)
        }
    }

    fn fixed(proba: [f64; 2]) -> Arc<FixedEstimator> {
        Arc::new(FixedEstimator {
            proba,
            calls: AtomicUsize::new(0),
        })
    }

    fn app_with(store: ModelStore) -> Router {
        let cors = cors_layer(&[LOCAL_UI.to_string()]).unwrap();
        router(
            AppState {
                models: Arc::new(store),
            },
            cors,
        )
    }

    fn predict_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    const MID_CHASE: &str = r#"{
        "batting_team": "A", "bowling_team": "B", "venue": "X",
        "runs_left": 50, "balls_left": 30, "wickets_left": 5, "target_runs": 150,
        "current_run_rate": 8.5, "required_run_rate": 10.0
    }"#;

    #[tokio::test]
    async fn test_predict_maps_classes_to_sides() {
        let estimator = fixed([0.3, 0.7]);
        let app = app_with(ModelStore::preloaded(estimator.clone()));

        let (status, body) = send(app, predict_request(MID_CHASE)).await;
        assert_eq!(status, StatusCode::OK);
        let batting = body["batting_win"].as_f64().unwrap();
        let bowling = body["bowling_win"].as_f64().unwrap();
        assert_relative_eq!(batting, 0.7, epsilon = 1e-12);
        assert_relative_eq!(bowling, 0.3, epsilon = 1e-12);
        assert_relative_eq!(batting + bowling, 1.0, epsilon = 1e-9);
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_field_is_422_without_inference() {
        let estimator = fixed([0.3, 0.7]);
        let app = app_with(ModelStore::preloaded(estimator.clone()));
        let body = r#"{
            "batting_team": "A", "bowling_team": "B", "venue": "X",
            "runs_left": 50, "balls_left": 30, "target_runs": 150,
            "crr": 8.5, "rrr": 10.0
        }"#;

        let (status, json) = send(app, predict_request(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["detail"].as_str().unwrap().contains("wickets_left"));
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_422() {
        let estimator = fixed([0.3, 0.7]);
        let app = app_with(ModelStore::preloaded(estimator.clone()));
        let (status, json) = send(app, predict_request("{\"batting_team\": ")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["detail"].is_string());
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_negative_values_are_422() {
        let estimator = fixed([0.3, 0.7]);
        let app = app_with(ModelStore::preloaded(estimator.clone()));
        let body = MID_CHASE.replace("\"runs_left\": 50", "\"runs_left\": -4");

        let (status, json) = send(app, predict_request(&body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["detail"].as_str().unwrap().contains("runs_left"));
        assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_probabilities_are_500() {
        let app = app_with(ModelStore::preloaded(fixed([-0.2, 1.2])));
        let (status, json) = send(app, predict_request(MID_CHASE)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["detail"]
            .as_str()
            .unwrap()
            .contains("Invalid probability values"));
    }

    #[tokio::test]
    async fn test_zero_required_rate_via_client_aliases() {
        let app = app_with(ModelStore::preloaded(fixed([0.45, 0.55])));
        let body = r#"{
            "batting_team": "A", "bowling_team": "B", "venue": "X",
            "runs_left": 0, "balls_left": 6, "wickets_left": 4, "total_runs_x": 160,
            "crr": 8.0, "rrr": 0
        }"#;
        let (status, json) = send(app, predict_request(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_relative_eq!(json["batting_win"].as_f64().unwrap(), 0.55, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn test_lazy_load_failure_then_recovery() {
        let path = scratch_model_path("api");
        let store = ModelStore::new(&path, None, RetryPolicy::default());
        let app = app_with(store);

        let (status, json) = send(app.clone(), predict_request(MID_CHASE)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["detail"].as_str().unwrap().contains("Configuration error"));

        let (_, health) = send(
            app.clone(),
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(health["model_loaded"], Value::Bool(false));

        // Artifact appears (e.g. copied in by an operator); the next request loads it.
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, test_artifact_bytes((0.7f64 / 0.3).ln())).unwrap();

        let (status, json) = send(app.clone(), predict_request(MID_CHASE)).await;
        assert_eq!(status, StatusCode::OK);
        assert_relative_eq!(json["batting_win"].as_f64().unwrap(), 0.7, epsilon = 1e-9);
        assert_relative_eq!(json["bowling_win"].as_f64().unwrap(), 0.3, epsilon = 1e-9);

        let (_, health) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(health["model_loaded"], Value::Bool(true));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let app = app_with(ModelStore::preloaded(fixed([0.5, 0.5])));

        let (status, json) = send(app.clone(), Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "IPL Prediction API is running");

        let (status, json) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model_loaded"], Value::Bool(true));
        assert!(json["timestamp"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .is_some());
    }

    #[tokio::test]
    async fn test_cors_preflight_for_allowed_origin_only() {
        let app = app_with(ModelStore::preloaded(fixed([0.5, 0.5])));
        let preflight = |origin: &str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/predict")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(preflight(LOCAL_UI)).await.unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            LOCAL_UI
        );
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );

        let resp = app.oneshot(preflight("https://evil.example")).await.unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_cors_layer_rejects_bad_origin() {
        assert!(cors_layer(&["http://bad\nexample".to_string()]).is_err());
        assert!(cors_layer(&["*".to_string()]).is_ok());
    }
}
