use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use ratchet_core::error::RatchetError;
use ratchet_core::state::{as_state, State as StepState};
use ratchet_core::SYSTEM_USER;

use super::response::{ApiError, ApiResult};
use super::AppState;
use crate::store::{
    ProcessField, ProcessFilter, ProcessRecord, ProcessSort, ProcessStepRecord,
    ProcessSubscription,
};

/// One row of the process list.
#[derive(Debug, Serialize)]
pub struct ProcessListItem {
    pub process_id: Uuid,
    pub workflow: String,
    pub last_status: String,
    pub last_step: Option<String>,
    pub assignee: String,
    pub failed_reason: Option<String>,
    pub is_task: bool,
    pub created_by: String,
    pub started_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl From<&ProcessRecord> for ProcessListItem {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            process_id: record.process_id,
            workflow: record.workflow_name.clone(),
            last_status: record.last_status.as_str().to_string(),
            last_step: record.last_step.clone(),
            assignee: record.assignee.as_str().to_string(),
            failed_reason: record.failed_reason.clone(),
            is_task: record.is_task,
            created_by: record.created_by.clone(),
            started_at: record.created_at,
            last_modified_at: record.last_modified_at,
        }
    }
}

/// Full process detail including the step log.
#[derive(Debug, Serialize)]
pub struct ProcessDetail {
    #[serde(flatten)]
    pub summary: ProcessListItem,
    pub traceback: Option<String>,
    pub current_state: StepState,
    pub steps: Vec<ProcessStepDetail>,
    pub subscriptions: Vec<ProcessSubscription>,
}

#[derive(Debug, Serialize)]
pub struct ProcessStepDetail {
    pub step_id: Uuid,
    pub name: String,
    pub status: String,
    pub state: StepState,
    pub created_by: String,
    pub executed_at: DateTime<Utc>,
}

impl From<&ProcessStepRecord> for ProcessStepDetail {
    fn from(step: &ProcessStepRecord) -> Self {
        Self {
            step_id: step.step_id,
            name: step.name.clone(),
            status: step.status.as_str().to_string(),
            state: step.state.clone(),
            created_by: step.created_by.clone(),
            executed_at: step.executed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub range: Option<String>,
    pub sort: Option<String>,
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReporterParam {
    pub reporter: Option<String>,
}

fn resolve_user(state: &AppState, headers: &HeaderMap, reporter: Option<String>) -> (String, Option<ratchet_core::workflow::UserClaims>) {
    let claims = (state.auth)(headers);
    let user = reporter
        .or_else(|| claims.as_ref().map(|c| c.user_name.clone()))
        .unwrap_or_else(|| SYSTEM_USER.to_string());
    (user, claims)
}

async fn ensure_unlocked(state: &AppState) -> Result<(), ApiError> {
    let status = state.engine.settings().status().await?;
    if status.global_lock {
        tracing::info!("Unable to interact with processes at this time, engine is locked");
        return Err(RatchetError::EngineLocked.into());
    }
    Ok(())
}

fn parse_process_id(key: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(key)
        .map_err(|_| RatchetError::NotFound(format!("Process {} not found", key)).into())
}

/// `POST /api/processes/{workflow_key}`
pub async fn new_process(
    State(state): State<AppState>,
    Path(workflow_key): Path<String>,
    Query(reporter): Query<ReporterParam>,
    headers: HeaderMap,
    Json(user_inputs): Json<Vec<StepState>>,
) -> ApiResult<impl IntoResponse> {
    ensure_unlocked(&state).await?;
    let (user, claims) = resolve_user(&state, &headers, reporter.reporter);

    let process_id = state
        .engine
        .processes()
        .start_process(&workflow_key, user_inputs, &user, claims.as_ref())
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"id": process_id}))))
}

/// `PUT /api/processes/{id}/resume`
pub async fn resume(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(reporter): Query<ReporterParam>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<StatusCode> {
    ensure_unlocked(&state).await?;
    let process_id = parse_process_id(&key)?;
    let (user, claims) = resolve_user(&state, &headers, reporter.reporter);

    let user_inputs = match body {
        Value::Array(items) => items.into_iter().map(as_state).collect(),
        Value::Object(map) => vec![map],
        Value::Null => Vec::new(),
        _ => return Err(RatchetError::FormInvalid("Expected a form input".to_string()).into()),
    };

    state
        .engine
        .processes()
        .resume_process(process_id, user_inputs, &user, claims.as_ref())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/processes/{id}/callback/{token}`
pub async fn callback(
    State(state): State<AppState>,
    Path((key, token)): Path<(String, String)>,
    Json(input_data): Json<StepState>,
) -> ApiResult<StatusCode> {
    ensure_unlocked(&state).await?;
    let process_id = parse_process_id(&key)?;

    state
        .engine
        .processes()
        .continue_awaiting_process(process_id, &token, input_data)
        .await?;

    Ok(StatusCode::OK)
}

/// `POST /api/processes/{id}/callback/{token}/progress`
pub async fn callback_progress(
    State(state): State<AppState>,
    Path((key, token)): Path<(String, String)>,
    Json(data): Json<Value>,
) -> ApiResult<StatusCode> {
    ensure_unlocked(&state).await?;
    let process_id = parse_process_id(&key)?;

    state
        .engine
        .processes()
        .update_awaiting_process_progress(process_id, &token, data)
        .await?;

    Ok(StatusCode::OK)
}

/// `PUT /api/processes/{id}/abort`
pub async fn abort(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(reporter): Query<ReporterParam>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let process_id = parse_process_id(&key)?;
    let (user, _claims) = resolve_user(&state, &headers, reporter.reporter);

    state.engine.processes().abort_process(process_id, &user).await?;
    if let Err(e) = state.engine.broadcaster().invalidate_status_counts().await {
        tracing::warn!(error = %e, "Failed to broadcast status count invalidation");
    }

    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /api/processes/resume-all`
pub async fn resume_all(
    State(state): State<AppState>,
    Query(reporter): Query<ReporterParam>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    ensure_unlocked(&state).await?;
    let (user, _claims) = resolve_user(&state, &headers, reporter.reporter);

    let candidates = state.engine.processes().resume_all_candidates().await?;
    let count = candidates.len();

    if !state
        .engine
        .processes()
        .async_resume_processes(candidates, &user)
        .await?
    {
        return Err(RatchetError::ResumeAllInProgress.into());
    }

    tracing::info!(count, "Resuming all processes");
    Ok(Json(json!({"count": count})))
}

/// `DELETE /api/processes/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let process_id = parse_process_id(&key)?;
    state.engine.processes().delete_process(process_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/processes/status-counts`
pub async fn status_counts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let counts = state.engine.processes().status_counts().await?;
    Ok(Json(counts))
}

/// `GET /api/processes/{id}`
pub async fn show(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let process_id = parse_process_id(&key)?;
    let (record, steps, subscriptions) = state.engine.processes().detail(process_id).await?;

    let current_state = steps.last().map(|s| s.state.clone()).unwrap_or_default();
    let detail = ProcessDetail {
        summary: (&record).into(),
        traceback: record.traceback.clone(),
        current_state,
        steps: steps.iter().map(Into::into).collect(),
        subscriptions,
    };
    Ok(Json(detail))
}

/// `GET /api/processes`
///
/// Supports `range=start,end`, `sort=field,dir,...` and
/// `filter=field,value,...` query parameters, a weak CRC32 ETag and
/// `Content-Range` pagination.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let range = parse_range(params.range.as_deref())?;
    let sorts = parse_sorts(params.sort.as_deref())?;
    let filters = parse_filters(params.filter.as_deref())?;

    let (records, total) = state
        .engine
        .processes()
        .store()
        .list(&filters, &sorts, range)
        .await?;

    let entity_tag = list_etag(&records);

    if let Some(if_none_match) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        if normalize_etag(if_none_match) == entity_tag {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            append_etag(&mut response, &entity_tag);
            return Ok(response);
        }
    }

    let items: Vec<ProcessListItem> = records.iter().map(Into::into).collect();
    let mut response = Json(items).into_response();
    append_etag(&mut response, &entity_tag);
    if let Some((start, end)) = range {
        if let Ok(value) = format!("processes {}-{}/{}", start, end, total).parse() {
            response.headers_mut().insert("content-range", value);
        }
    }
    Ok(response)
}

fn append_etag(response: &mut Response, entity_tag: &str) {
    if let Ok(value) = format!("W/\"{}\"", entity_tag).parse() {
        response.headers_mut().insert("etag", value);
    }
}

/// CRC32 checksum over every row's process id and last-modified timestamp,
/// in listing order. Any visible change to the listing changes the tag.
pub fn list_etag(records: &[ProcessRecord]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    for record in records {
        hasher.update(record.process_id.as_bytes());
        let seconds = record.last_modified_at.timestamp_micros() as f64 / 1e6;
        hasher.update(&seconds.to_le_bytes());
    }
    format!("{:#x}", hasher.finalize())
}

/// Accept both a bare tag and the full `W/"..."` header form.
fn normalize_etag(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
}

fn parse_range(raw: Option<&str>) -> Result<Option<(i64, i64)>, ApiError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        return Err(RatchetError::RangeInvalid(raw.to_string()).into());
    }
    let start = parts[0]
        .parse()
        .map_err(|_| RatchetError::RangeInvalid(raw.to_string()))?;
    let end = parts[1]
        .parse()
        .map_err(|_| RatchetError::RangeInvalid(raw.to_string()))?;
    if start < 0 || end < start {
        return Err(RatchetError::RangeInvalid(raw.to_string()).into());
    }
    Ok(Some((start, end)))
}

fn parse_sorts(raw: Option<&str>) -> Result<Vec<ProcessSort>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() % 2 != 0 {
        return Err(RatchetError::FilterInvalid("Invalid number of sort arguments".to_string()).into());
    }

    let mut sorts = Vec::new();
    for pair in parts.chunks(2) {
        let field = ProcessField::parse(pair[0])
            .ok_or_else(|| RatchetError::FilterInvalid(format!("Unable to sort on unknown field: {}", pair[0])))?;
        let descending = match pair[1].to_ascii_lowercase().as_str() {
            "asc" => false,
            "desc" => true,
            other => {
                return Err(RatchetError::FilterInvalid(format!("Unknown sort order: {}", other)).into())
            }
        };
        sorts.push(ProcessSort { field, descending });
    }
    Ok(sorts)
}

fn parse_filters(raw: Option<&str>) -> Result<Vec<ProcessFilter>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.is_empty() || parts.len() % 2 != 0 {
        return Err(
            RatchetError::FilterInvalid("Invalid number of filter arguments".to_string()).into(),
        );
    }

    let mut filters = Vec::new();
    for pair in parts.chunks(2) {
        let field = ProcessField::parse(pair[0])
            .ok_or_else(|| RatchetError::FilterInvalid(format!("Unknown filter field: {}", pair[0])))?;
        filters.push(ProcessFilter {
            field,
            value: pair[1].to_string(),
        });
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::signal::ProcessStatus;
    use ratchet_core::workflow::Assignee;

    fn record(modified_micros: i64) -> ProcessRecord {
        ProcessRecord {
            process_id: Uuid::from_u128(42),
            workflow_name: "wf".to_string(),
            last_status: ProcessStatus::Completed,
            last_step: None,
            assignee: Assignee::System,
            failed_reason: None,
            traceback: None,
            workflow_digest: None,
            is_task: false,
            created_by: "alice".to_string(),
            created_at: Utc::now(),
            last_modified_at: DateTime::from_timestamp_micros(modified_micros).unwrap(),
        }
    }

    #[test]
    fn test_etag_stable_for_unchanged_rows() {
        let rows = vec![record(1_000_000), record(2_000_000)];
        assert_eq!(list_etag(&rows), list_etag(&rows));
    }

    #[test]
    fn test_etag_changes_on_modification() {
        let before = vec![record(1_000_000)];
        let after = vec![record(1_000_001)];
        assert_ne!(list_etag(&before), list_etag(&after));
    }

    #[test]
    fn test_etag_changes_on_reorder() {
        let a = record(1_000_000);
        let mut b = record(2_000_000);
        b.process_id = Uuid::from_u128(7);

        let one = list_etag(&[a.clone(), b.clone()]);
        let two = list_etag(&[b, a]);
        assert_ne!(one, two);
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("W/\"0xabc\""), "0xabc");
        assert_eq!(normalize_etag("0xabc"), "0xabc");
        assert_eq!(normalize_etag(" \"0xabc\" "), "0xabc");
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range(Some("0,49")).unwrap(), Some((0, 49)));
        assert!(parse_range(Some("49,0")).is_err());
        assert!(parse_range(Some("1")).is_err());
        assert!(parse_range(Some("a,b")).is_err());
        assert_eq!(parse_range(None).unwrap(), None);
    }

    #[test]
    fn test_parse_sorts() {
        let sorts = parse_sorts(Some("modified,desc,workflow,asc")).unwrap();
        assert_eq!(sorts.len(), 2);
        assert!(sorts[0].descending);
        assert!(!sorts[1].descending);

        assert!(parse_sorts(Some("modified")).is_err());
        assert!(parse_sorts(Some("bogus,asc")).is_err());
        assert!(parse_sorts(Some("modified,sideways")).is_err());
    }

    #[test]
    fn test_parse_filters() {
        let filters = parse_filters(Some("status,failed,is_task,true")).unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].field, ProcessField::Status);
        assert_eq!(filters[1].value, "true");

        assert!(parse_filters(Some("status")).is_err());
        assert!(parse_filters(Some("bogus,1")).is_err());
    }
}
