use axum::{extract::State, Json};
use tracing::debug;

use crate::api::{ApiError, SortingPostRequestBody, SortingResponse};

use super::app::AppState;

pub async fn post_sorting(
    State(state): State<AppState>,
    Json(payload): Json<SortingPostRequestBody>,
) -> Result<Json<SortingResponse>, ApiError> {
    debug!("received payload: {:?}", payload);

    let length = payload.name.chars().count();
    if length == 0 || length > state.max_name_length {
        return Err(ApiError::InvalidName(state.max_name_length));
    }

    let record = state.allocator.assign(&payload.name).await?;

    Ok(Json(SortingResponse {
        success: true,
        data: record,
    }))
}
