use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

mod upload;

use crate::config::ServerConfig;
use crate::error::EnhanceError;
use crate::image_io::{decode_image, encode_png};
use crate::model_registry::{ModelCache, ModelEntry};
use crate::pipeline::Pipeline;
use crate::strategy::{filter_selectors, EnhancementStrategy};
use upload::{read_enhance_form, EnhanceForm};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pipeline: Pipeline,
    models: Arc<ModelCache>,
    job_slots: Arc<Semaphore>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Pipeline, models: Arc<ModelCache>, server: &ServerConfig) -> Self {
        let slots = server.max_concurrent_jobs.max(1);
        info!(
            max_concurrent_jobs = slots,
            max_upload_bytes = server.max_upload_bytes,
            models = models.registry().list().len(),
            "Server state ready"
        );
        Self {
            inner: Arc::new(AppStateInner {
                pipeline,
                models,
                job_slots: Arc::new(Semaphore::new(slots)),
                max_upload_bytes: server.max_upload_bytes,
            }),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.max_upload_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/enhancements", get(list_enhancements))
        .route("/api/enhance", post(enhance))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    Json(state.inner.models.registry().list().to_vec())
}

/// Every selector `/api/enhance` accepts: filters first, then models.
async fn list_enhancements(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut selectors = filter_selectors();
    selectors.extend(
        state
            .inner
            .models
            .registry()
            .list()
            .iter()
            .map(ModelEntry::selector),
    );
    Json(selectors)
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn enhance(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let EnhanceForm {
        filename,
        image,
        enhancement,
        factor,
    } = read_enhance_form(&mut multipart).await?;
    let strategy = EnhancementStrategy::parse(&enhancement, factor)?;

    let request_id = Uuid::new_v4();
    info!(
        request_id = %request_id,
        filename = %filename,
        bytes = image.len(),
        enhancement = %strategy.label(),
        factor,
        "Enhancement requested"
    );

    let _permit = state
        .inner
        .job_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(format!("job slots closed: {e}")))?;

    let started = Instant::now();
    let inner = Arc::clone(&state.inner);
    let png = tokio::task::spawn_blocking(move || {
        let decoded = decode_image(&image, inner.pipeline.tile_config())?;
        let output = inner
            .pipeline
            .enhance(&decoded, &strategy, inner.models.as_ref())?;
        encode_png(&output)
    })
    .await
    .map_err(|e| AppError::Internal(format!("task join error: {e}")))?
    .map_err(|err| {
        warn!(request_id = %request_id, error = %err, "Enhancement failed");
        AppError::from(err)
    })?;

    info!(
        request_id = %request_id,
        bytes = png.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Enhancement completed"
    );

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<EnhanceError> for AppError {
    fn from(err: EnhanceError) -> Self {
        if err.is_client_error() {
            AppError::BadRequest(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}
