//! Cookie sessions.
//!
//! The session stage reads the signed session cookie, loads the record from
//! the configured store and exposes it to handlers as a [`SessionHandle`].
//! After the handler runs, modified sessions are saved and the cookie is
//! (re)issued. A store that cannot be reached leaves the request without a
//! session; the security stage turns that into a 403.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

use super::AppState;
use crate::error::FleetError;
use super::error::StageError;
use super::store::SessionRecord;

/// Header reporting how long the request took inside the session stage.
pub const X_RESPONSE_TIME: &str = "x-response-time";

type HmacSha256 = Hmac<Sha256>;

/// Signs cookie values with HMAC-SHA256.
///
/// Signed values look like `s:<value>.<hex signature>`.
#[derive(Clone)]
pub struct CookieSigner {
    mac: HmacSha256,
}

impl CookieSigner {
    pub fn new(secret: &str) -> Result<Self, FleetError> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| FleetError::Config(format!("unusable session secret: {}", e)))?;
        Ok(Self { mac })
    }

    pub fn sign(&self, value: &str) -> String {
        let tag = self.keyed(value).finalize().into_bytes();
        format!("s:{}.{}", value, hex(&tag))
    }

    /// Return the original value if `signed` carries a valid signature.
    pub fn unsign(&self, signed: &str) -> Option<String> {
        let (value, signature) = signed.strip_prefix("s:")?.rsplit_once('.')?;
        let signature = decode_hex(signature)?;
        self.keyed(value).verify_slice(&signature).ok()?;
        Some(value.to_string())
    }

    fn keyed(&self, value: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        mac
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

struct SessionState {
    id: String,
    record: SessionRecord,
    is_new: bool,
    modified: bool,
    destroyed: bool,
}

/// The current request's session.
///
/// Cloning shares the same session; changes are persisted once the handler
/// returns.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    fn new(id: String, record: SessionRecord, is_new: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState {
                id,
                record,
                is_new,
                modified: false,
                destroyed: false,
            })),
        }
    }

    fn fresh(ttl: Duration) -> Self {
        Self::new(Uuid::new_v4().to_string(), SessionRecord::new(ttl), true)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A poisoned lock only means a handler panicked mid-update
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> String {
        self.state().id.clone()
    }

    pub fn user(&self) -> Option<String> {
        self.state().record.user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().record.user.is_some()
    }

    /// Mark the session as belonging to `user`.
    pub fn set_user(&self, user: impl Into<String>) {
        let mut state = self.state();
        state.record.user = Some(user.into());
        state.modified = true;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().record.data.get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let mut state = self.state();
        state.record.data.insert(key.into(), value);
        state.modified = true;
    }

    /// Remove the session from the store and clear the cookie.
    pub fn destroy(&self) {
        self.state().destroyed = true;
    }
}

impl<S: Send + Sync> FromRequestParts<S> for SessionHandle {
    type Rejection = StageError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .ok_or_else(|| StageError::Unhandled("route has no session stage".to_string()))
    }
}

/// Find the value of cookie `name` in the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| {
            let value = value.trim_matches('"');
            match value.strip_prefix("s%3A") {
                Some(rest) => format!("s:{}", rest),
                None => value.to_string(),
            }
        })
}

/// Session stage.
pub async fn session_stage(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let settings = &state.config.session;

    let signed_id = cookie_value(request.headers(), settings.cookie_name)
        .and_then(|value| state.signer.unsign(&value));
    let handle = match signed_id {
        Some(id) => match state.store.load(&id).await {
            Ok(Some(record)) => Some(SessionHandle::new(id, record, false)),
            Ok(None) => Some(SessionHandle::fresh(settings.ttl)),
            Err(e) => {
                warn!(error = %e, "Session store unavailable");
                None
            }
        },
        None => Some(SessionHandle::fresh(settings.ttl)),
    };

    if let Some(handle) = &handle {
        request.extensions_mut().insert(handle.clone());
    }

    let mut response = next.run(request).await;

    if let Some(handle) = handle {
        persist(&state, &handle, &mut response).await;
    }

    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}ms", elapsed)) {
        response.headers_mut().insert(X_RESPONSE_TIME, value);
    }
    response
}

async fn persist(state: &AppState, handle: &SessionHandle, response: &mut Response) {
    let settings = &state.config.session;
    let (id, record, is_new, modified, destroyed) = {
        let s = handle.state();
        (s.id.clone(), s.record.clone(), s.is_new, s.modified, s.destroyed)
    };

    if destroyed {
        if !is_new && let Err(e) = state.store.destroy(&id).await {
            error!(error = %e, "Failed to destroy session");
        }
        set_cookie(response, &clear_cookie(settings.cookie_name));
        return;
    }

    if !modified {
        return;
    }

    let mut record = record;
    record.touch(settings.ttl);
    match state.store.save(&id, &record).await {
        Ok(()) => {
            let cookie = format!(
                "{}={}; Path=/; Max-Age={}; HttpOnly{}",
                settings.cookie_name,
                state.signer.sign(&id),
                settings.ttl.as_secs(),
                if settings.secure { "; Secure" } else { "" },
            );
            set_cookie(response, &cookie);
        }
        Err(e) => error!(error = %e, "Failed to save session"),
    }
}

fn clear_cookie(name: &str) -> String {
    format!("{}=; Path=/; Max-Age=0; HttpOnly", name)
}

fn set_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}
