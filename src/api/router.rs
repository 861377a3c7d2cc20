//! API router.
//!
//! Returns a composable `Router` with every endpoint under `/api/`,
//! wrapped in a CORS layer for the configured review UI origin.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the API router over shared state.
pub fn api_router(core: Arc<CoreState>) -> Router {
    let cors_origin = core.config.cors_origin.clone();
    let ctx = ApiContext::new(core);

    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/models", get(endpoints::models::list))
        .route("/documents", post(endpoints::documents::ingest))
        .route("/runs", post(endpoints::runs::start))
        .route("/runs/:id", get(endpoints::runs::status))
        .route("/runs/:id/cancel", post(endpoints::runs::cancel))
        .route("/runs/:id/abandon", post(endpoints::runs::abandon))
        .route("/runs/:id/dead-letters", get(endpoints::runs::dead_letters))
        .route("/runs/:id/low-confidence", get(endpoints::runs::low_confidence))
        .route("/runs/:id/export-readiness", get(endpoints::runs::export_readiness))
        .route("/dead-letters/:id/resolve", post(endpoints::runs::resolve_dead_letter))
        .route("/samples", post(endpoints::samples::create))
        .route("/samples/:id/next", get(endpoints::samples::next))
        .route("/samples/:id/report", get(endpoints::samples::report))
        .route("/sample-items/:id", get(endpoints::samples::reviewed))
        .route("/sample-items/:id/label", post(endpoints::samples::label))
        .with_state(ctx);

    let router = Router::new().nest("/api", api);
    match HeaderValue::from_str(&cors_origin) {
        Ok(origin) => router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        ),
        Err(e) => {
            tracing::warn!(origin = %cors_origin, error = %e, "Invalid CORS origin, CORS disabled");
            router
        }
    }
}
