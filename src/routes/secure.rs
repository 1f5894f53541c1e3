//! Routes that require a logged-in user.

use axum::{http::StatusCode, routing::get};
use serde_json::{Value, json};

use super::{AppRouter, Stage, StageBundle};
use crate::server::body::ParsedBody;
use crate::server::reply::Reply;
use crate::server::session::SessionHandle;

const NOTES_KEY: &str = "notes";

pub fn routes(router: AppRouter, stages: &StageBundle) -> AppRouter {
    let router = router
        .route("/", get(whoami))
        .route("/notes", get(list_notes).post(add_note));
    stages.apply(
        router,
        &[Stage::Helpers, Stage::Session, Stage::Body, Stage::Security],
    )
}

async fn whoami(session: SessionHandle) -> Reply {
    Reply::success(json!({ "user": session.user() }))
}

async fn list_notes(session: SessionHandle) -> Reply {
    Reply::success(json!({ "notes": notes(&session) }))
}

async fn add_note(session: SessionHandle, body: ParsedBody) -> Reply {
    let Some(text) = body.field("note").filter(|n| !n.trim().is_empty()) else {
        return Reply::error("note is required").with_status(StatusCode::BAD_REQUEST);
    };

    let mut notes = notes(&session);
    notes.push(Value::String(text.to_string()));
    session.insert(NOTES_KEY, Value::Array(notes.clone()));
    Reply::success(json!({ "notes": notes })).with_status(StatusCode::CREATED)
}

fn notes(session: &SessionHandle) -> Vec<Value> {
    match session.get(NOTES_KEY) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}
