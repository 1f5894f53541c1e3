//! Pipeline stages shared by every route module.
//!
//! Request flow, outermost first:
//!
//! ```text
//! method override -> trace -> request id -> compression -> [dev request log]
//!   -> error stage -> panic catcher -> render stage
//!   -> route module stages (helpers, session, body, security) -> handler
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tracing::{Instrument, error, info};
use uuid::Uuid;

use super::AppState;
use super::error::{Failure, StageError, classify};
use super::reply::{DEFAULT_CACHE_CONTROL, PendingRender};

/// Header name for request correlation IDs.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation ID of the current request.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Method and path of a request, as views see them.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

impl RequestInfo {
    fn of(request: &Request) -> Self {
        Self {
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
        }
    }
}

/// Tag every request with a correlation ID and run it inside a span.
///
/// A client-supplied `X-Request-ID` is reused, otherwise a UUIDv4 is minted.
/// The ID is echoed on the response.
pub async fn request_id_stage(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

/// Header a form or client without full method support uses to tunnel the
/// real method through a POST.
pub static X_HTTP_METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");

static OVERRIDABLE_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
];

/// Replace the method of a POST with the one named in `X-HTTP-Method-Override`.
///
/// Only the first comma-separated value counts, and only standard methods
/// are accepted. Must run before routing.
pub async fn method_override_stage(mut request: Request, next: Next) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let requested = request
        .headers()
        .get(&X_HTTP_METHOD_OVERRIDE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_uppercase());
    if let Some(method) = requested
        .and_then(|m| OVERRIDABLE_METHODS.iter().find(|known| known.as_str() == m))
    {
        tracing::debug!(method = %method, "Overriding POST method");
        *request.method_mut() = method.clone();
    }

    let mut response = next.run(request).await;
    response.headers_mut().append(
        header::VARY,
        HeaderValue::from_static("X-HTTP-Method-Override"),
    );
    response
}

/// Path prefix printed by [`request_log`].
#[derive(Clone, Debug, Default)]
pub struct LogPrefix(pub Arc<str>);

impl LogPrefix {
    pub fn new(prefix: &str) -> Self {
        Self(prefix.into())
    }
}

/// Log a timestamped line for every request.
///
/// Inside a nested route module the URI is relative to the mount point, so
/// the module's prefix is printed in front of it.
pub async fn request_log(State(prefix): State<LogPrefix>, request: Request, next: Next) -> Response {
    info!(
        "{} {} {}{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        request.method(),
        prefix.0,
        request.uri()
    );
    next.run(request).await
}

/// Helpers stage: responses that set no caching policy are not cached.
pub async fn helpers_stage(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static(DEFAULT_CACHE_CONTROL));
    response
}

/// Render views left on the response by [`Reply::serve`](super::reply::Reply::serve).
///
/// Views see `request`, `status` and the handler's `data`. A view that fails
/// to render becomes a 500 failure.
pub async fn render_stage(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let info = RequestInfo::of(&request);
    let mut response = next.run(request).await;
    let Some(pending) = response.extensions_mut().remove::<PendingRender>() else {
        return response;
    };

    let context = json!({
        "request": info,
        "status": response.status().as_u16(),
        "data": pending.data,
    });
    match state.views.render(&pending.template, &context) {
        Ok(html) => {
            let (mut parts, _) = response.into_parts();
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(html))
        }
        Err(source) => StageError::Render {
            template: pending.template,
            source,
        }
        .into_response(),
    }
}

/// Error stage: turn failed responses into error pages.
///
/// The view is picked by [`classify`]. Failure details are shown only outside
/// production.
pub async fn error_stage(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let info = RequestInfo::of(&request);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let mut response = next.run(request).await;
    let Some(failure) = response.extensions_mut().remove::<Failure>() else {
        return response;
    };

    let (view, status) = classify(response.status());
    error!(
        request_id = %request_id,
        method = %info.method,
        path = %info.path,
        status = status.as_u16(),
        "{}",
        failure.message
    );

    let detail = if state.config.environment.is_production() {
        ""
    } else {
        failure.message.as_str()
    };
    error_page(&state, view.template(), status, &info, detail)
}

fn error_page(
    state: &AppState,
    template: &str,
    status: StatusCode,
    info: &RequestInfo,
    detail: &str,
) -> Response {
    let title = status.canonical_reason().unwrap_or("Error");
    let context = json!({
        "request": info,
        "status": status.as_u16(),
        "title": title,
        "error": detail,
    });
    match state.views.render(template, &context) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            error!(template, error = %e, "Failed to render error view");
            (status, format!("{} {}", status.as_u16(), title)).into_response()
        }
    }
}

/// Turn a handler panic into a failure for the error stage.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    StageError::Unhandled(message).into_response()
}
