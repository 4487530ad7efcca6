//! HTTP surface. Translates requests into engine calls; no domain logic
//! beyond argument validation lives here.

mod error;
mod floors;
mod people;
mod reservations;
mod workspaces;

pub use error::{ApiError, ApiResult, JsonBody, PathId, QueryParams};

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::image::{DownloadUrlTemplate, ImageSink};
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS, HTTP_TIMEOUTS_TOTAL};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub images: Arc<dyn ImageSink>,
    pub download_url: DownloadUrlTemplate,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    pub request_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_in_flight: 256,
        }
    }
}

pub fn router(state: AppState, opts: RouterOptions) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(floors::routes())
        .merge(workspaces::routes())
        .merge(reservations::booking_routes())
        .merge(reservations::offering_routes())
        .merge(people::routes())
        .layer(middleware::from_fn_with_state(opts.request_timeout, deadline))
        .layer(middleware::from_fn(record_metrics))
        .layer(GlobalConcurrencyLimitLayer::new(opts.max_in_flight))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Drops the handler future once the deadline passes. A write that already
/// holds its workspace locks still runs to completion.
async fn deadline(State(timeout): State<Duration>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            metrics::counter!(HTTP_TIMEOUTS_TOTAL).increment(1);
            ApiError::timeout().into_response()
        }
    }
}

/// Request metrics, plus one log line per non-2xx response naming the
/// method and route.
async fn record_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let matched = req.extensions().get::<MatchedPath>().map(|p| p.as_str().to_string());
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            route = matched.as_deref().unwrap_or(&path),
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request failed"
        );
    } else if !status.is_success() {
        tracing::warn!(
            method = %method,
            route = matched.as_deref().unwrap_or(&path),
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request rejected"
        );
    }

    // unmatched paths share one label
    let route = matched.unwrap_or_else(|| "unmatched".to_string());
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method.clone(), "route" => route.clone())
        .record(elapsed.as_secs_f64());
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "route" => route,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    response
}
