use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use check_common::jobs::Jobs;

pub mod async_check;

use async_check::ErrorResponse;

#[derive(Clone)]
pub struct AppState {
    /// `None` when the async feature is disabled; submit and poll then
    /// answer 503.
    pub jobs: Option<Arc<dyn Jobs>>,
    /// When set, every async endpoint requires a matching bearer token.
    pub api_key: Option<String>,
}

pub fn add_routes(router: Router, state: AppState, max_body_size: usize) -> Router {
    let api = Router::new()
        .route(
            "/api/async/check",
            routing::post(async_check::submit)
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route(
            "/api/async/check/",
            routing::post(async_check::submit)
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route("/api/async/check/:job_id", routing::get(async_check::poll))
        .route("/api/async/check/:job_id/", routing::get(async_check::poll))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop here, axum answering is enough
        .merge(api)
}

pub async fn index() -> &'static str {
    "check api"
}

/// Bearer-token check for the async endpoints. Open when no key is
/// configured (local development).
async fn require_api_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided != Some(expected) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid or missing API key".to_owned(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}
