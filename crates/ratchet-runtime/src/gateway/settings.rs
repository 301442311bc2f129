use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use ratchet_core::settings::{EngineStatus, WorkerStatus};
use ratchet_core::SYSTEM_USER;

use super::processes::ReporterParam;
use super::response::ApiResult;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SetStatusBody {
    pub global_lock: bool,
}

/// `GET /api/settings/status`
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<EngineStatus>> {
    Ok(Json(state.engine.settings().status().await?))
}

/// `PUT /api/settings/status`
pub async fn set_status(
    State(state): State<AppState>,
    Query(reporter): Query<ReporterParam>,
    headers: HeaderMap,
    Json(body): Json<SetStatusBody>,
) -> ApiResult<Json<EngineStatus>> {
    let claims = (state.auth)(&headers);
    let user = reporter
        .reporter
        .or_else(|| claims.map(|c| c.user_name))
        .unwrap_or_else(|| SYSTEM_USER.to_string());

    let status = state
        .engine
        .settings()
        .set_global_lock(body.global_lock, &user)
        .await?;
    Ok(Json(status))
}

/// `GET /api/settings/worker-status`
pub async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.engine.settings().worker_status().await)
}
