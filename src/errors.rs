use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenzaError {
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream provider rejected our credentials.
    #[error("provider authentication failed: {0}")]
    Unauthenticated(String),

    /// The client's own credential was rejected by the backend.
    #[error("unauthorized")]
    Unauthorized(StatusCode),

    #[error("rate limited by upstream")]
    RateLimited,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("stream decryption failed: {0}")]
    Decryption(String),

    /// Provider returned a manifest without a usable stream URL.
    #[error("provider response missing stream data: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("file system error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Internal(String),
}

impl CadenzaError {
    /// HTTP status a handler should answer with when this error reaches the
    /// edge. Cancelled never reaches a client that is still connected, but
    /// maps to 499-ish termination if it somehow does.
    pub fn status(&self) -> StatusCode {
        match self {
            CadenzaError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            CadenzaError::NotFound(_) => StatusCode::NOT_FOUND,
            CadenzaError::Unauthorized(status) => *status,
            CadenzaError::Unauthenticated(_)
            | CadenzaError::RateLimited
            | CadenzaError::Transient(_)
            | CadenzaError::Integrity(_)
            | CadenzaError::Http(_) => StatusCode::BAD_GATEWAY,
            CadenzaError::Decryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CadenzaError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            CadenzaError::Io(_) | CadenzaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CadenzaError::Cancelled)
    }
}

impl From<serde_json::Error> for CadenzaError {
    fn from(e: serde_json::Error) -> Self {
        CadenzaError::Internal(format!("serialization error: {}", e))
    }
}

impl From<anyhow::Error> for CadenzaError {
    fn from(e: anyhow::Error) -> Self {
        CadenzaError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CadenzaError>;
