use reqwest::StatusCode;
use thiserror::Error;

use super::transport::TransportError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] TransportError),

    #[error("Not signed in")]
    NoToken,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 401 | 403 => AuthError::InvalidCredentials(truncated),
            500..=599 => AuthError::ServerError(truncated),
            _ => AuthError::ServerError(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True for failures that end the session rather than a single request.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, AuthError::NoToken | AuthError::RefreshFailed(_))
    }

    /// Human-readable message for display to the user.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidInput(msg) => msg.clone(),
            AuthError::InvalidCredentials(detail) => {
                let detail = detail.to_lowercase();
                if detail.contains("user not found") {
                    "User does not exist".to_string()
                } else if detail.contains("none_provided") {
                    "Please enter an email or login id".to_string()
                } else {
                    "Invalid login id or password".to_string()
                }
            }
            AuthError::ServerError(_) => {
                "The server ran into a problem. Please try again later.".to_string()
            }
            AuthError::MalformedResponse(_) => {
                "The server sent an unexpected response. Please try again later.".to_string()
            }
            AuthError::NetworkError(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::NetworkError(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::NoToken => "You are not signed in.".to_string(),
            AuthError::RefreshFailed(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
        }
    }
}
