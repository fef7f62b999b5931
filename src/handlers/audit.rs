use axum::{
    Json,
    extract::{Path, Query, State},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::AppState;
use crate::services::audit::AuditLogEntry;
use crate::utils::ApiResult;

/// List recent audit log entries (newest first).
#[utoipa::path(
    get,
    path = "/audit/logs",
    params(("limit" = Option<i64>, Query, description = "Max entries (default 100)")),
    responses((status = 200, description = "Audit entries", body = Vec<AuditLogEntry>)),
    tag = "Audit"
)]
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    let limit = params
        .get("limit")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(100);
    let entries = state.audit_service.list(limit).await?;
    Ok(Json(entries))
}

/// Delete one audit log entry.
#[utoipa::path(
    delete,
    path = "/audit/logs/{id}",
    params(("id" = i64, Path, description = "Audit entry id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Unknown id")
    ),
    tag = "Audit"
)]
pub async fn delete_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.audit_service.delete(id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}
