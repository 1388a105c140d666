use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use sorting_common::allocator::Allocator;
use sorting_common::ledger::Ledger;
use sorting_common::metrics::track_metrics;

use super::{history, sorting};

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,
    pub max_name_length: usize,
    pub history_limit: u32,
}

impl AppState {
    pub fn new(allocator: Arc<Allocator>, max_name_length: usize, history_limit: u32) -> Self {
        Self {
            allocator,
            max_name_length,
            history_limit,
        }
    }
}

pub fn add_routes(
    router: Router<AppState>,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(readiness))
        .route("/_liveness", routing::get(index)) // No async loop for now, just check axum health
        .route(
            "/api/sorting",
            routing::post(sorting::post_sorting)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/api/sorting-history", routing::get(history::list_history))
        .route(
            "/api/sorting-history/delete",
            routing::delete(history::delete_by_query),
        )
        .route(
            "/api/sorting-history/:id",
            routing::get(history::get_by_id).delete(history::delete_by_path),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "sorting-hat api"
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.allocator.ledger().ping().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(err) => {
            warn!("ledger is not ready: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "ledger unavailable")
        }
    }
}
