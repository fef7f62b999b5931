use axum::{Json, extract::State};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::models::dataframe_from_rows;
use crate::services::VisualizationResponse;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize, ToSchema)]
pub struct VisualizeRequest {
    pub user_query: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Object>)]
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub retrieved_context: Option<String>,
}

/// Recommend chart plans for an executed result set.
#[utoipa::path(
    post,
    path = "/visualize",
    request_body = VisualizeRequest,
    responses(
        (status = 200, description = "Ranked chart plans", body = VisualizationResponse),
        (status = 400, description = "Row cap exceeded or malformed frame")
    ),
    tag = "Visualize"
)]
pub async fn visualize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VisualizeRequest>,
) -> ApiResult<Json<VisualizationResponse>> {
    let max_rows = state.config.visualize.max_rows;
    if request.rows.len() > max_rows {
        return Err(ApiError::validation_error(format!(
            "row count {} exceeds VIS_MAX_ROWS {}",
            request.rows.len(),
            max_rows
        )));
    }
    let columns = if request.columns.is_empty() {
        request
            .rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        request.columns.clone()
    };
    if columns.is_empty() {
        return Err(ApiError::validation_error("columns are required"));
    }

    let df = dataframe_from_rows(&columns, request.rows);
    let response = state
        .chart_engine
        .recommend(&request.user_query, &df, request.retrieved_context.as_deref())
        .await;
    Ok(Json(response))
}
