//! Response helpers.
//!
//! Handlers return a [`Reply`] built from one of the constructors here
//! instead of assembling responses by hand. JSON replies share one envelope:
//! an object with a `success` flag merged in. View replies are not rendered
//! by the handler; they leave a [`PendingRender`] on the response for the
//! render stage.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Default `Cache-Control` for responses that did not choose one.
pub const DEFAULT_CACHE_CONTROL: &str = "private, max-age=0, no-cache";

/// A view waiting to be rendered by the render stage.
#[derive(Debug, Clone)]
pub struct PendingRender {
    pub template: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
enum ReplyBody {
    Empty,
    Json(Value),
    View(PendingRender),
}

/// A handler's answer.
#[derive(Debug, Clone)]
#[must_use]
pub struct Reply {
    status: StatusCode,
    body: ReplyBody,
    cache_control: Option<String>,
    location: Option<&'static str>,
}

impl Reply {
    fn new(status: StatusCode, body: ReplyBody) -> Self {
        Self {
            status,
            body,
            cache_control: None,
            location: None,
        }
    }

    /// 200 with `result` wrapped in the success envelope.
    pub fn success(result: impl Serialize) -> Self {
        Self::envelope(true, result)
    }

    /// 200 with `result` wrapped in the failure envelope.
    pub fn fail(result: impl Serialize) -> Self {
        Self::envelope(false, result)
    }

    /// 200 with `{"success": false, "errors": [message]}`.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::OK,
            ReplyBody::Json(json!({ "success": false, "errors": [err.to_string()] })),
        )
    }

    pub fn rate_limit() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, ReplyBody::Empty)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ReplyBody::Empty)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, ReplyBody::Empty)
    }

    pub fn not_found() -> Self {
        Self::serve("errors/404", Value::Null).with_status(StatusCode::NOT_FOUND)
    }

    pub fn redirect_to_login() -> Self {
        let mut reply = Self::new(StatusCode::FOUND, ReplyBody::Empty);
        reply.location = Some("/");
        reply
    }

    /// Render `template` with `data` available as `data.*`.
    pub fn serve(template: impl Into<String>, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self::new(
                StatusCode::OK,
                ReplyBody::View(PendingRender {
                    template: template.into(),
                    data,
                }),
            ),
            Err(e) => Self::serialize_failure(e),
        }
    }

    /// Let clients cache the response for `max_age` seconds.
    pub fn cache(mut self, max_age: u64) -> Self {
        self.cache_control = Some(format!("max-age={}", max_age));
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    fn envelope(success: bool, result: impl Serialize) -> Self {
        let value = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => return Self::serialize_failure(e),
        };
        let body = match value {
            Value::Object(mut map) => {
                map.insert("success".to_string(), Value::Bool(success));
                Value::Object(map)
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("success".to_string(), Value::Bool(success));
                Value::Object(map)
            }
            other => json!({ "success": success, "data": other }),
        };
        Self::new(StatusCode::OK, ReplyBody::Json(body))
    }

    fn serialize_failure(e: serde_json::Error) -> Self {
        tracing::error!(error = %e, "Failed to serialize reply");
        Self::error(e).with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            ReplyBody::Empty => self.status.into_response(),
            ReplyBody::Json(value) => (self.status, Json(value)).into_response(),
            ReplyBody::View(pending) => {
                let mut response = self.status.into_response();
                response.extensions_mut().insert(pending);
                response
            }
        };

        let headers = response.headers_mut();
        if let Some(cache_control) = self.cache_control
            && let Ok(value) = HeaderValue::from_str(&cache_control)
        {
            headers.insert(header::CACHE_CONTROL, value);
        }
        if let Some(location) = self.location {
            headers.insert(header::LOCATION, HeaderValue::from_static(location));
        }
        response
    }
}
