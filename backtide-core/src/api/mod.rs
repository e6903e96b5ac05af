//! HTTP control surface for the backup module

use axum::{
    extract::Extension,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::error::BacktideError;
use crate::module::BackupModule;

pub mod handlers;

/// Application state for the control endpoints
#[derive(Clone)]
pub struct AppState {
    pub module: Arc<BackupModule>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub error: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Create the control API router
pub fn create_api_router(module: Arc<BackupModule>) -> Router {
    let app_state = AppState { module };

    Router::new()
        .route("/backup/info", get(handlers::get_info))
        .route("/backup/status", get(handlers::get_status))
        .route("/backup/start", post(handlers::start_backup))
        .route("/backup/pause", post(handlers::pause_backup))
        .route("/backup/resume", post(handlers::resume_backup))
        .route("/backup/cancel", post(handlers::cancel_backup))
        .route("/backup/times", get(handlers::get_backup_times))
        .route(
            "/backup/location",
            get(handlers::get_location).put(handlers::set_location),
        )
        .route("/backup/automatic/enable", post(handlers::enable_automatic))
        .route("/backup/automatic/disable", post(handlers::disable_automatic))
        .route("/backup/login-url", get(handlers::get_login_url))
        .route("/backup/auth/callback", get(handlers::auth_callback))
        .route("/backup/estimate", get(handlers::estimate_size))
        .route("/backup/forget", post(handlers::forget_all))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(app_state)),
        )
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    let error = ErrorResponse {
        code: status.as_u16(),
        error: status.canonical_reason().unwrap_or("Unknown").to_string(),
        message: message.into(),
        timestamp: chrono::Utc::now(),
    };
    (status, Json(error))
}

/// Map engine errors onto HTTP statuses
pub fn handle_backtide_error(error: BacktideError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        BacktideError::NotFound { .. } => StatusCode::NOT_FOUND,
        BacktideError::InvalidOperation { .. } => StatusCode::CONFLICT,
        BacktideError::ConfigurationError { .. } | BacktideError::Validation { .. } => {
            StatusCode::BAD_REQUEST
        }
        BacktideError::Authentication { .. } => StatusCode::UNAUTHORIZED,
        BacktideError::NetworkError(_)
        | BacktideError::TemporaryFailure { .. }
        | BacktideError::Timeout { .. }
        | BacktideError::HttpStatus { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, error.to_string())
}
