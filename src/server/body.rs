//! Request body parsing stage.
//!
//! JSON and URL-encoded form bodies up to [`BODY_LIMIT`] bytes are parsed
//! into a JSON value that handlers read through [`ParsedBody`]. The raw bytes
//! are put back on the request, so handlers may still consume the body.

use axum::{
    Form,
    body::{Body, Bytes},
    extract::{FromRequest, FromRequestParts, Request},
    http::{HeaderMap, Method, header, request::Parts},
    middleware::Next,
    response::Response,
};
use serde_json::{Map, Value};

use super::error::StageError;

/// Largest body the stage accepts.
pub const BODY_LIMIT: usize = 100 * 1024;

/// Parsed request body. An object for forms and for requests without a body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBody(pub Value);

impl ParsedBody {
    /// String field of an object body.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ParsedBody {
    type Rejection = StageError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ParsedBody>()
            .cloned()
            .ok_or_else(|| StageError::Unhandled("route has no body stage".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Form,
    Other,
}

impl BodyKind {
    fn of(headers: &HeaderMap) -> Self {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return Self::Other;
        };
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime == "application/json" || mime.ends_with("+json") {
            Self::Json
        } else if mime == "application/x-www-form-urlencoded" {
            Self::Form
        } else {
            Self::Other
        }
    }
}

/// Body parsing stage.
pub async fn body_stage(request: Request, next: Next) -> Result<Response, StageError> {
    let kind = BodyKind::of(request.headers());
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > BODY_LIMIT) {
        return Err(StageError::BodyTooLarge { limit: BODY_LIMIT });
    }

    let (mut parts, body) = request.into_parts();
    // Anything past the declared-length check failing here is a body that
    // streamed past the limit
    let bytes = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|_| StageError::BodyTooLarge { limit: BODY_LIMIT })?;

    let parsed = match kind {
        BodyKind::Json if bytes.iter().all(u8::is_ascii_whitespace) => Value::Object(Map::new()),
        BodyKind::Json => {
            serde_json::from_slice(&bytes).map_err(|e| StageError::BodyParse(e.to_string()))?
        }
        BodyKind::Form => parse_form(bytes.clone()).await?,
        BodyKind::Other => Value::Object(Map::new()),
    };

    parts.extensions.insert(ParsedBody(parsed));
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

async fn parse_form(bytes: Bytes) -> Result<Value, StageError> {
    let request = Request::builder()
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(bytes))
        .map_err(|e| StageError::Unhandled(e.to_string()))?;
    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|e| StageError::BodyParse(e.body_text()))?;
    Ok(pairs_to_object(pairs))
}

/// Collect form pairs into an object. Repeated keys, and keys ending in
/// `[]`, become arrays.
fn pairs_to_object(pairs: Vec<(String, String)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        let (key, force_array) = match key.strip_suffix("[]") {
            Some(stripped) => (stripped.to_string(), true),
            None => (key, false),
        };
        let value = Value::String(value);
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None if force_array => {
                map.insert(key, Value::Array(vec![value]));
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}
