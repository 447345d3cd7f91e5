//! Prometheus plumbing for the two binaries. The recorder is configured
//! with bucket grids sized to this service's two latency profiles: HTTP
//! submit/poll handlers (redis round-trips, sub-second) and end-to-end task
//! processing (checker calls bounded by the per-request timeout, up to
//! minutes with retries).

use std::future::ready;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_SECONDS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

const TASK_SECONDS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Install the process-wide recorder, wrap every route already in `router`
/// with request tracking, and expose `/metrics`. Call once per binary; a
/// second recorder install fails.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = install_recorder();
    // `/metrics` is added after the tracking layer so scrapes do not count
    // themselves.
    router
        .layer(axum::middleware::from_fn(track_requests))
        .route("/metrics", get(move || ready(handle.render())))
}

fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_owned()),
            REQUEST_SECONDS,
        )
        .expect("request bucket grid is non-empty")
        .set_buckets_for_metric(
            Matcher::Full("check_task_duration_seconds".to_owned()),
            TASK_SECONDS,
        )
        .expect("task bucket grid is non-empty")
        .install_recorder()
        .expect("no other metrics recorder is installed")
}

/// Count and time every finished request, labelled by the matched route
/// template rather than the raw path, which would explode cardinality on
/// `/api/async/check/{job_id}`.
async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().as_str().to_owned();

    let started = Instant::now();
    let response = next.run(request).await;

    let labels = [
        ("route", route),
        ("method", method),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}

/// Bind and serve a router. The worker uses this for its liveness/metrics
/// side port.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}
