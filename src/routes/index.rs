//! Landing page and login.

use axum::{
    http::StatusCode,
    routing::{get, post},
};
use serde_json::json;

use super::{AppRouter, Stage, StageBundle};
use crate::server::body::ParsedBody;
use crate::server::reply::Reply;
use crate::server::session::SessionHandle;

pub fn routes(router: AppRouter, stages: &StageBundle) -> AppRouter {
    let router = router
        .route("/", get(home))
        .route("/login", post(login))
        .route("/logout", post(logout));
    stages.apply(router, &[Stage::Helpers, Stage::Session, Stage::Body])
}

async fn home(session: SessionHandle) -> Reply {
    Reply::serve("index", json!({ "user": session.user() }))
}

async fn login(session: SessionHandle, body: ParsedBody) -> Reply {
    let Some(user) = body
        .field("username")
        .map(str::trim)
        .filter(|u| !u.is_empty())
    else {
        return Reply::error("username is required").with_status(StatusCode::BAD_REQUEST);
    };

    session.set_user(user);
    tracing::info!(user, session = %session.id(), "User logged in");
    Reply::success(json!({ "user": user }))
}

async fn logout(session: SessionHandle) -> Reply {
    if let Some(user) = session.user() {
        tracing::info!(user, "User logged out");
    }
    session.destroy();
    Reply::redirect_to_login()
}
