//! HTTP routes

pub mod csrf;
pub mod files;
pub mod health;
pub mod upload;

use std::any::Any as PanicPayload;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::Span;
use uuid::Uuid;

use crate::csrf::{CSRF_COOKIE, CSRF_HEADER};
use crate::error::AppError;
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Header carrying the per-request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Room for multipart framing and text fields around the file part
const FORM_OVERHEAD: u64 = 1024 * 1024;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let single_limit = body_limit(state.config().upload.max_upload_size);
    let chunk_limit = body_limit(state.uploads().max_chunk_size());

    let single_upload = Router::new()
        .route("/upload", post(upload::upload_single))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(single_limit));

    let chunk_upload = Router::new()
        .route("/upload/chunk", post(upload::upload_chunk))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(chunk_limit));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/options", get(health::upload_options))
        .route("/csrf", get(csrf::issue_token))
        .route("/upload/finalize", post(upload::finalize))
        .route("/file/:id", get(files::get_file))
        .route("/file/:id/sample", get(files::get_sample))
        .merge(single_upload)
        .merge(chunk_upload)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(CatchPanicLayer::custom(handle_panic))
        // Echo X-Request-Id on every response
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        // Generate X-Request-Id unless the client sent one
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors_layer(state.config().server.base_url.as_deref()))
        .with_state(state)
}

fn body_limit(max: u64) -> usize {
    usize::try_from(max.saturating_add(FORM_OVERHEAD)).unwrap_or(usize::MAX)
}

// ============================================================================
// Middleware
// ============================================================================

/// Request id generator using random UUIDs
#[derive(Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Trace span tagged with the request id
fn request_span(request: &Request) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    tracing::info_span!(
        "http_request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
    )
}

/// Turn a handler panic into the usual JSON 500
fn handle_panic(panic: Box<dyn PanicPayload + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Request handler panicked");
    AppError::Internal(format!("handler panicked: {}", detail)).into_response()
}

fn cors_layer(base_url: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    match base_url.and_then(|url| HeaderValue::from_str(url).ok()) {
        Some(origin) => cors.allow_origin(origin),
        None => cors.allow_origin(Any),
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Run blocking store work off the async runtime
pub(crate) async fn run_blocking<T, E, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
        .map_err(Into::into)
}

/// Check the double-submit CSRF tokens of a state-changing request
pub(crate) fn verify_csrf(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
    form_token: Option<&str>,
) -> Result<(), AppError> {
    let presented = form_token
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(CSRF_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let cookie = jar
        .get(CSRF_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_default();

    if state.csrf().validate(presented.trim(), cookie.trim()) {
        Ok(())
    } else {
        tracing::warn!("CSRF validation failed");
        Err(AppError::Auth("CSRF token validation failed".to_string()))
    }
}

/// Origin used in share links: configured base URL, else the request host
pub(crate) fn public_base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config().server.base_url {
        return base.clone();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| *p == "https" || *p == "http")
        .unwrap_or("http");
    format!("{}://{}", scheme, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::Value;

    #[tokio::test]
    async fn test_panicking_handler_returns_json_error() {
        let app = Router::new()
            .route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("boom");
                    }
                    "unreachable"
                }),
            )
            .layer(CatchPanicLayer::custom(handle_panic));
        let server = TestServer::new(app).unwrap();

        let response = server.get("/boom").await;
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: Value = response.json();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "internal_error");
    }

    #[test]
    fn test_request_ids_are_uuids() {
        let request = axum::http::Request::new(());
        let id = MakeRequestUuid.make_request_id(&request).unwrap();
        let value = id.header_value().to_str().unwrap();
        assert!(value.parse::<Uuid>().is_ok());
    }
}
