//! Error taxonomy shared by every component.
//!
//! Variants split along the same line the control API uses to pick a status
//! code: caller-attributable mistakes (bad input, name collisions, missing
//! records) versus daemon-attributable failures (anything that went wrong
//! while the daemon was doing its job).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("image extraction failed: {0}")]
    Extraction(String),

    #[error("address bind failed: {0}")]
    Bind(String),

    #[error("runc launch failed: {0}")]
    RuntimeLaunch(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("fd handoff failed: {0}")]
    Handoff(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PoolExhausted
            | Error::Extraction(_)
            | Error::Bind(_)
            | Error::RuntimeLaunch(_)
            | Error::Timeout(_)
            | Error::Handoff(_)
            | Error::Internal(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}
