use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// The remote site rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote site asked us to slow down and retries were exhausted.
    #[error("Rate limited by remote site: {0}")]
    RateLimited(String),

    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Natural-key uniqueness was violated and the update retry failed too.
    #[error("Constraint violation on {table}: {message}")]
    ConstraintViolation {
        /// Table the write targeted.
        table: String,
        /// Storage engine message.
        message: String,
    },

    /// Caller is not logged in.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is logged in but may not access the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid request input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient failure talking to the remote site.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A remote call exceeded the request timeout.
    #[error("Remote request timed out after {0} seconds")]
    Timeout(u64),

    /// A stored session token could not be decoded.
    #[error("Session token error: {0}")]
    Session(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a queued job failing with this error should be delivered again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Remote(_) | AppError::Timeout(_) | AppError::ConstraintViolation { .. }
        )
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Remote(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Authentication(_) | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Remote(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
