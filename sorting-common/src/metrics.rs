use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Sorting is one short transaction, retries included: most requests finish well under 100ms,
/// and anything past the default statement timeout has already failed.
const SORTING_LATENCY_SECONDS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0,
];

/// Requests that matched no route share one label, so unknown paths cannot grow cardinality.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Add a `/metrics` route rendering everything recorded through the `metrics` facade.
/// Installing a global recorder when used as a library (during tests etc) does not work well,
/// so callers decide whether to install one.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_owned()),
            SORTING_LATENCY_SECONDS,
        )?
        .install_recorder()
}

/// Count and time every request by route template, so `/api/sorting-history/:id` is one series.
pub async fn track_metrics(
    matched_path: Option<MatchedPath>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = matched_path
        .as_ref()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_owned();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("sorting_http_requests_total", &labels).increment(1);
    metrics::histogram!("sorting_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
