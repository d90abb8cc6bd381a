//! API error types and their HTTP mapping.
//!
//! Peer failures never appear here: the ring swallows them and the front
//! door always has a local fallback. Only collaborator failures and
//! client-supplied mistakes reach the caller.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced on the external HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed payload
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid bearer token
    #[error("authentication required: {0}")]
    Unauthorized(String),

    /// Registration for a name that already exists
    #[error("user {0} already exists")]
    UserExists(String),

    /// Login for a name nobody registered
    #[error("user {0} not found, please register")]
    UnknownUser(String),

    /// Login with the wrong password
    #[error("password does not match")]
    WrongPassword,

    /// The scrape collaborator could not fetch the URL
    #[error("scraping {url} failed: {reason}")]
    ScrapeFailed { url: String, reason: String },

    /// Node is mid-shutdown and takes no new work
    #[error("node is shutting down")]
    ShuttingDown,

    /// Artifact store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Request to a peer's HTTP API failed; only ever logged, never served
    #[error("peer request failed: {0}")]
    Peer(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownUser(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UserExists(_) | Self::WrongPassword => StatusCode::CONFLICT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::ScrapeFailed { .. }
            | Self::Storage(_)
            | Self::Peer(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
        }))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Peer(err.to_string())
    }
}
