//! HTTP interface for the face memory daemon.
//!
//! - `POST /add`        enroll `{image_base64, comment}`
//! - `POST /recognize`  match every face in `{image_base64}`
//! - `GET  /status`     store and threshold summary
//! - `GET  /health`     liveness

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facemem_core::{
    EnrollError, EnrollmentService, FaceEmbedder, RecognitionService, RecognitionStatus,
    RecognizeError, SharedStore, Thresholds,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Services and the store they share, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    enrollment: Arc<EnrollmentService>,
    recognition: Arc<RecognitionService>,
    store: SharedStore,
    thresholds: Thresholds,
}

impl AppState {
    pub fn new(store: SharedStore, embedder: Arc<dyn FaceEmbedder>, thresholds: Thresholds) -> Self {
        let enrollment = EnrollmentService::new(store.clone(), embedder.clone())
            .with_threshold(thresholds.dedup);
        let recognition = RecognitionService::new(store.clone(), embedder)
            .with_limits(thresholds.recognition, thresholds.max_faces);
        Self {
            enrollment: Arc::new(enrollment),
            recognition: Arc::new(recognition),
            store,
            thresholds,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub image_base64: String,
    pub comment: String,
}

#[derive(Debug, Serialize)]
pub struct AddResponse {
    pub result: String,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    pub image_base64: String,
}

#[derive(Debug, Serialize)]
pub struct FaceMatch {
    pub name: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub status: RecognitionStatus,
    pub faces_detected: usize,
    pub faces: Vec<FaceMatch>,
}

/// Error body: `{"error": <stable code>, "message": <display text>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn worker_failed(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = %err, "blocking worker failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "request worker failed".into(),
        }
    }
}

/// Body extraction failures: malformed JSON, missing fields, wrong content
/// type, or a body over the size limit.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            "payload_too_large"
        } else {
            "invalid_request"
        };
        let message = rejection.body_text();
        tracing::debug!(%status, error = %message, "request body rejected");
        Self { status, code, message }
    }
}

impl From<EnrollError> for ApiError {
    fn from(err: EnrollError) -> Self {
        let status = match &err {
            EnrollError::EmptyLabel | EnrollError::Decode(_) => StatusCode::BAD_REQUEST,
            EnrollError::NoFaceDetected => StatusCode::UNPROCESSABLE_ENTITY,
            EnrollError::AlreadyEnrolled { .. } => StatusCode::CONFLICT,
            EnrollError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            EnrollError::Detection(_) | EnrollError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "enroll failed");
        }
        Self { status, code: err.code(), message: err.to_string() }
    }
}

impl From<RecognizeError> for ApiError {
    fn from(err: RecognizeError) -> Self {
        let status = match &err {
            RecognizeError::Decode(_) => StatusCode::BAD_REQUEST,
            RecognizeError::Detection(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RecognizeError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "recognize failed");
        }
        Self { status, code: err.code(), message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Build the router with CORS open to any origin and per-request tracing.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/add", post(add_face))
        .route("/recognize", post(recognize_faces))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn add_face(
    State(state): State<AppState>,
    payload: Result<Json<AddRequest>, JsonRejection>,
) -> Result<Json<AddResponse>, ApiError> {
    let Json(req) = payload?;
    tracing::info!(label = %req.comment, bytes = req.image_base64.len(), "add requested");
    let service = state.enrollment.clone();
    let enrolled = tokio::task::spawn_blocking(move || service.enroll(&req.image_base64, &req.comment))
        .await
        .map_err(ApiError::worker_failed)??;

    Ok(Json(AddResponse { result: enrolled.message() }))
}

async fn recognize_faces(
    State(state): State<AppState>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let Json(req) = payload?;
    tracing::info!(bytes = req.image_base64.len(), "recognize requested");
    let service = state.recognition.clone();
    let report = tokio::task::spawn_blocking(move || service.recognize(&req.image_base64))
        .await
        .map_err(ApiError::worker_failed)??;

    Ok(Json(RecognizeResponse {
        status: report.status,
        faces_detected: report.faces_detected,
        faces: report
            .matches
            .into_iter()
            .map(|m| FaceMatch { name: m.label, confidence: m.confidence })
            .collect(),
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let (records, consistent, dim) = tokio::task::spawn_blocking(move || {
        store
            .read()
            .map(|s| (s.len(), s.is_consistent(), s.dim()))
            .map_err(|_| EnrollError::StoreUnavailable)
    })
    .await
    .map_err(ApiError::worker_failed)??;

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "records": records,
        "consistent": consistent,
        "dim": dim,
        "thresholds": state.thresholds,
    })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
