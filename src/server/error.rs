//! Pipeline error handling.
//!
//! A stage that fails returns a [`StageError`]. Its response carries no body,
//! only the status and a [`Failure`] extension; the error stage at the top of
//! the pipeline turns that into an HTML error page chosen by [`classify`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use super::views::RenderError;

/// Marker left on a response by a failed stage.
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
}

/// Error raised by a pipeline stage or handler.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Malformed request body: {0}")]
    BodyParse(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Failed to render '{template}': {source}")]
    Render {
        template: String,
        #[source]
        source: RenderError,
    },

    /// A failure whose status the handler chose.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// A failure with no status of its own. Classified as a server error.
    #[error("{0}")]
    Unhandled(String),
}

impl StageError {
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Status the response carries when it reaches the error stage.
    ///
    /// `Unhandled` keeps the default 200; the error stage promotes it to 500.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyParse(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Render { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Status { status, .. } => *status,
            Self::Unhandled(_) => StatusCode::OK,
        }
    }
}

impl IntoResponse for StageError {
    fn into_response(self) -> Response {
        let mut response = self.status().into_response();
        response.extensions_mut().insert(Failure {
            message: self.to_string(),
        });
        response
    }
}

/// Error page chosen for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorView {
    ServerError,
    BadRequest,
    Other,
}

impl ErrorView {
    pub fn template(&self) -> &'static str {
        match self {
            Self::ServerError => "errors/500",
            Self::BadRequest => "errors/400",
            Self::Other => "errors/other",
        }
    }
}

/// Pick the error view for the status a failed response carries.
///
/// 200 means nothing set a status before failing, so it is treated as a
/// server error. Returns the view and the status to send.
pub fn classify(status: StatusCode) -> (ErrorView, StatusCode) {
    let code = status.as_u16();
    if code == 200 || code >= 500 {
        let status = if code == 200 {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            status
        };
        (ErrorView::ServerError, status)
    } else if (400..404).contains(&code) {
        (ErrorView::BadRequest, status)
    } else {
        (ErrorView::Other, status)
    }
}
