use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or incomplete payload, surfaced as 400.
    #[error("{0}")]
    Validation(String),

    /// Referenced conversation, membership, or counterpart does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Caller's role does not permit the operation.
    #[error("{0}")]
    Forbidden(&'static str),

    /// Backing store failure. Synchronous callers see a 500; the poll
    /// worker instead skips the cycle and retries on the next tick.
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Store(e) => {
                error!("storage error while handling request: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self {
            // Do not leak driver internals to clients.
            Error::Store(_) => "storage error".to_string(),
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}
