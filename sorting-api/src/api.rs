use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use sorting_common::allocator::AllocationError;
use sorting_common::ledger::{LedgerError, SortingResult};

/// The body of a request made to sort a participant.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct SortingPostRequestBody {
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct SortingResponse {
    pub success: bool,
    pub data: SortingResult,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct HistoryResponse {
    pub success: bool,
    pub data: Vec<SortingResult>,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct DeleteResponse {
    pub success: bool,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("name must be between 1 and {0} characters")]
    InvalidName(usize),
    #[error("missing id of the sorting result to delete")]
    MissingId,
    #[error("sorting result not found")]
    NotFound,
    #[error("all houses are full, please contact an administrator")]
    AllFull,
    #[error("{0}")]
    InvalidInput(String),
    #[error("a database error occurred, please retry")]
    LedgerUnavailable(#[from] LedgerError),
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::AllFull => ApiError::AllFull,
            AllocationError::InvalidInput(reason) => ApiError::InvalidInput(reason),
            AllocationError::PersistenceFailure(err) => ApiError::LedgerUnavailable(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidName(_)
            | ApiError::MissingId
            | ApiError::AllFull
            | ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,

            ApiError::NotFound => StatusCode::NOT_FOUND,

            ApiError::LedgerUnavailable(ref err) => {
                error!("ledger error: {}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
