use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::models::DocKind;
use crate::utils::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct PoolStatusResponse {
    pub pool_count: usize,
    pub keys: Vec<String>,
}

/// Executor pool status (entry count per user key).
#[utoipa::path(
    get,
    path = "/admin/oracle/pool/status",
    responses((status = 200, description = "Pool entries", body = PoolStatusResponse)),
    tag = "Admin"
)]
pub async fn oracle_pool_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PoolStatusResponse>> {
    Ok(Json(PoolStatusResponse {
        pool_count: state.executor_pool.pool_count(),
        keys: state.executor_pool.keys(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TableScopeResponse {
    pub user: Option<String>,
    pub tables: Vec<String>,
    pub effectively_all: bool,
}

/// Effective table scope for a user (global fallback applies).
#[utoipa::path(
    get,
    path = "/admin/settings/table-scope",
    params(("user" = Option<String>, Query, description = "User name (optional)")),
    responses((status = 200, description = "Effective scope", body = TableScopeResponse)),
    tag = "Admin"
)]
pub async fn get_table_scope(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<TableScopeResponse>> {
    let user = params.get("user").cloned();
    let tables = state.metadata_cache.load_table_scope(user.as_deref());
    let effectively_all = state.metadata_cache.scope_is_effectively_all(&tables);
    Ok(Json(TableScopeResponse { user, tables, effectively_all }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTableScopeRequest {
    #[serde(default)]
    pub user: Option<String>,
    pub tables: Vec<String>,
}

/// Replace a user's (or the global) table scope.
#[utoipa::path(
    post,
    path = "/admin/settings/table-scope",
    request_body = UpdateTableScopeRequest,
    responses((status = 200, description = "Scope saved", body = TableScopeResponse)),
    tag = "Admin"
)]
pub async fn set_table_scope(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateTableScopeRequest>,
) -> ApiResult<Json<TableScopeResponse>> {
    state
        .metadata_cache
        .save_table_scope(request.user.as_deref(), request.tables.clone())?;
    let effectively_all = state.metadata_cache.scope_is_effectively_all(&request.tables);
    Ok(Json(TableScopeResponse { user: request.user, tables: request.tables, effectively_all }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MetadataSyncResponse {
    pub invalidated: bool,
    pub corpus_counts: HashMap<String, usize>,
    pub schema_tables: usize,
}

/// Invalidate metadata caches; files reload lazily on next access.
#[utoipa::path(
    post,
    path = "/admin/metadata/sync",
    responses((status = 200, description = "Caches invalidated", body = MetadataSyncResponse)),
    tag = "Admin"
)]
pub async fn metadata_sync(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MetadataSyncResponse>> {
    state.metadata_cache.invalidate();
    let mut corpus_counts = HashMap::new();
    for kind in DocKind::ALL {
        corpus_counts.insert(kind.as_str().to_string(), state.metadata_cache.docs(kind).len());
    }
    Ok(Json(MetadataSyncResponse {
        invalidated: true,
        corpus_counts,
        schema_tables: state.metadata_cache.schema_table_count(),
    }))
}

/// Rebuild the retrieval view of the corpora (cache invalidation + reload).
#[utoipa::path(
    post,
    path = "/admin/rag/reindex",
    responses((status = 200, description = "Corpora reloaded", body = MetadataSyncResponse)),
    tag = "Admin"
)]
pub async fn rag_reindex(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MetadataSyncResponse>> {
    metadata_sync(State(state)).await
}
