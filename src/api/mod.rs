//! Kalshi API clients
//! Venue trait, REST client and request signing

pub mod auth;
pub mod kalshi;
pub mod venue;

pub use auth::{RequestSigner, StaticHeaderSigner};
pub use kalshi::KalshiClient;
pub use venue::{
    LivePosition, OrderAck, OrderAction, OrderRequest, OrderSnapshot, OrderState, Quote, Side,
    Venue,
};

#[cfg(test)]
pub use venue::MockVenue;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Rate limited")]
    RateLimited,
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Malformed venue data: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Transient failure worth retrying or skipping until the next cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Api { status, .. } => *status >= 500 || *status == 408,
            ApiError::RateLimited => true,
            ApiError::Json(_) | ApiError::Unauthorized(_) | ApiError::Malformed(_) => false,
        }
    }

    /// The request may have reached the venue although no answer came back
    pub fn outcome_unknown(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout(),
            ApiError::Api { status, .. } => *status == 504,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
            || matches!(self, ApiError::Api { status, .. } if *status == 401 || *status == 403)
    }
}

/// Sanitize API error message to avoid leaking sensitive information
/// In production, returns generic error message for 5xx
/// In debug mode, returns detailed error
pub fn sanitize_api_error(status: u16, detailed_message: String) -> ApiError {
    if status == 401 || status == 403 {
        return ApiError::Unauthorized(format!("status {}", status));
    }
    if status == 429 {
        return ApiError::RateLimited;
    }

    if cfg!(not(debug_assertions)) && status >= 500 {
        tracing::error!("API error {}: {}", status, detailed_message);
        return ApiError::Api {
            status,
            message: "Internal server error".to_string(),
        };
    }

    // 4xx bodies are usually safe but can be long
    let safe_message = if detailed_message.len() > 500 {
        let mut end = 500;
        while !detailed_message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &detailed_message[..end])
    } else {
        detailed_message
    };

    ApiError::Api {
        status,
        message: safe_message,
    }
}
