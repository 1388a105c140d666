use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_derive::Deserialize;
use tracing::info;
use uuid::Uuid;

use sorting_common::ledger::Ledger;

use crate::api::{ApiError, DeleteResponse, HistoryResponse, SortingResponse};

use super::app::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
pub struct DeleteParams {
    id: Option<Uuid>,
}

/// List the most recent sorting results, newest first.
pub async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(state.history_limit)
        .min(state.history_limit);

    let records = state.allocator.ledger().list_recent(limit).await?;

    Ok(Json(HistoryResponse {
        success: true,
        data: records,
    }))
}

pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SortingResponse>, ApiError> {
    let record = state
        .allocator
        .ledger()
        .get_by_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(SortingResponse {
        success: true,
        data: record,
    }))
}

pub async fn delete_by_path(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete(&state, id).await
}

pub async fn delete_by_query(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = params.id.ok_or(ApiError::MissingId)?;

    delete(&state, id).await
}

async fn delete(state: &AppState, id: Uuid) -> Result<Json<DeleteResponse>, ApiError> {
    if !state.allocator.ledger().delete_by_id(id).await? {
        return Err(ApiError::NotFound);
    }

    info!(%id, "deleted sorting result");

    Ok(Json(DeleteResponse { success: true }))
}
