use axum::{Json, extract::State};
use std::sync::Arc;

use crate::AppState;
use crate::models::{OneshotRequest, OrchestratorResult, RunRequest, RunResponse};
use crate::utils::ApiResult;

/// Generate SQL for a natural-language question (nothing is executed).
#[utoipa::path(
    post,
    path = "/query/oneshot",
    request_body = OneshotRequest,
    responses(
        (status = 200, description = "Orchestrator result with an opaque qid", body = OrchestratorResult),
        (status = 400, description = "Empty question or generation failure")
    ),
    tag = "Query"
)]
pub async fn oneshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OneshotRequest>,
) -> ApiResult<Json<OrchestratorResult>> {
    let result = state.orchestrator.oneshot(request).await?;
    Ok(Json(result))
}

/// Execute a previously generated query (by qid) or raw SQL under policy.
#[utoipa::path(
    post,
    path = "/query/run",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Executed rows plus repair metadata", body = RunResponse),
        (status = 400, description = "Execution error after repair"),
        (status = 403, description = "Policy violation"),
        (status = 404, description = "Unknown qid")
    ),
    tag = "Query"
)]
pub async fn run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> ApiResult<Json<RunResponse>> {
    let result = state.orchestrator.run(request).await?;
    Ok(Json(result))
}
