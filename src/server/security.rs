//! Authentication gate for protected route modules.

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::reply::Reply;
use super::session::SessionHandle;

/// What the gate found on the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// No session: the session stage was skipped or its store failed.
    NoSession,
    /// A session without a logged-in user.
    Anonymous,
    Authenticated,
}

impl Gate {
    pub fn check(session: Option<&SessionHandle>) -> Self {
        match session {
            None => Self::NoSession,
            Some(session) if session.is_authenticated() => Self::Authenticated,
            Some(_) => Self::Anonymous,
        }
    }
}

/// Security stage. Only authenticated requests reach the handler.
pub async fn security_stage(request: Request, next: Next) -> Response {
    match Gate::check(request.extensions().get::<SessionHandle>()) {
        Gate::NoSession => {
            tracing::warn!(path = %request.uri().path(), "No session object found for secured route");
            Reply::forbidden().into_response()
        }
        Gate::Anonymous => Reply::unauthorized().into_response(),
        Gate::Authenticated => next.run(request).await,
    }
}
