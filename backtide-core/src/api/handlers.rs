use super::{handle_backtide_error, ApiResult, AppState};
use crate::module::{BackupSizeEstimate, BackupTimes};
use crate::types::{BackupProgressInfo, BackupStatus};
use axum::extract::{Extension, OriginalUri};
use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Changed {
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Started {
    pub started: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationResponse {
    pub location: String,
    pub available: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetLocationRequest {
    pub location: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginUrlResponse {
    pub url: Option<String>,
}

pub async fn get_info(Extension(state): Extension<AppState>) -> Json<Option<BackupProgressInfo>> {
    Json(state.module.get_info())
}

pub async fn get_status(Extension(state): Extension<AppState>) -> ApiResult<BackupStatus> {
    state
        .module
        .backup_status()
        .await
        .map(Json)
        .map_err(handle_backtide_error)
}

pub async fn start_backup(Extension(state): Extension<AppState>) -> ApiResult<Started> {
    let started = state
        .module
        .start_backup()
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Started { started }))
}

pub async fn pause_backup(Extension(state): Extension<AppState>) -> Json<Changed> {
    Json(Changed {
        changed: state.module.pause_backup(),
    })
}

pub async fn resume_backup(Extension(state): Extension<AppState>) -> Json<Changed> {
    Json(Changed {
        changed: state.module.resume_backup(),
    })
}

pub async fn cancel_backup(Extension(state): Extension<AppState>) -> ApiResult<Changed> {
    state
        .module
        .cancel_backup()
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Changed { changed: true }))
}

pub async fn get_backup_times(Extension(state): Extension<AppState>) -> ApiResult<BackupTimes> {
    state
        .module
        .get_backup_times()
        .await
        .map(Json)
        .map_err(handle_backtide_error)
}

pub async fn get_location(Extension(state): Extension<AppState>) -> Json<LocationResponse> {
    Json(LocationResponse {
        location: state.module.backend_location(),
        available: state
            .module
            .available_locations()
            .into_iter()
            .map(String::from)
            .collect(),
    })
}

pub async fn set_location(
    Extension(state): Extension<AppState>,
    Json(request): Json<SetLocationRequest>,
) -> ApiResult<LocationResponse> {
    state
        .module
        .set_backend_location(&request.location)
        .await
        .map_err(handle_backtide_error)?;
    Ok(get_location(Extension(state)).await)
}

pub async fn enable_automatic(Extension(state): Extension<AppState>) -> ApiResult<Changed> {
    state
        .module
        .enable_automatic_backup()
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Changed { changed: true }))
}

pub async fn disable_automatic(Extension(state): Extension<AppState>) -> ApiResult<Changed> {
    state
        .module
        .disable_automatic_backup()
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Changed { changed: true }))
}

pub async fn get_login_url(Extension(state): Extension<AppState>) -> Json<LoginUrlResponse> {
    Json(LoginUrlResponse {
        url: state.module.login_url(),
    })
}

/// Landing page of the browser login flow
pub async fn auth_callback(
    Extension(state): Extension<AppState>,
    OriginalUri(uri): OriginalUri,
) -> ApiResult<Changed> {
    state
        .module
        .handle_login_redirected_back(&uri.to_string())
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Changed { changed: true }))
}

pub async fn estimate_size(Extension(state): Extension<AppState>) -> ApiResult<BackupSizeEstimate> {
    state
        .module
        .estimate_initial_backup_size()
        .await
        .map(Json)
        .map_err(handle_backtide_error)
}

pub async fn forget_all(Extension(state): Extension<AppState>) -> ApiResult<Changed> {
    state
        .module
        .forget_all_changes()
        .await
        .map_err(handle_backtide_error)?;
    Ok(Json(Changed { changed: true }))
}
