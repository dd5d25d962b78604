use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Unauthorized: {detail}")]
    Unauthorized { detail: String },

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request rejected ({status}): {detail}")]
    ClientError { status: u16, detail: String },

    #[error("Server error ({status}): {detail}")]
    ServerError { status: u16, detail: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
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

    /// Backend-provided detail if the body carries one, else the raw body
    fn detail(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for field in ["detail", "message", "error"] {
                if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                    return Self::truncate_body(text);
                }
            }
        }
        Self::truncate_body(body)
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = Self::detail(body);
        match status {
            401 => ApiError::Unauthorized { detail },
            403 => ApiError::Forbidden(detail),
            404 => ApiError::NotFound(detail),
            429 => ApiError::RateLimited(detail),
            500..=599 => ApiError::ServerError { status, detail },
            _ => ApiError::ClientError { status, detail },
        }
    }

    /// HTTP status behind the error, if a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::Forbidden(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited(_) => Some(429),
            ApiError::ClientError { status, .. } | ApiError::ServerError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Server faults and missing responses may succeed if sent again unchanged
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::ServerError { .. } | ApiError::Network(_) | ApiError::Timeout
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_builder() {
            ApiError::InvalidRequest(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
