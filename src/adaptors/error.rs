use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while relaying a call to an upstream vendor
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or invalid base URL, OAuth client settings, unknown vendor
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer from the vendor
    #[error("Upstream returned {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("Malformed vendor payload: {0}")]
    Parse(String),

    /// Token exchange or refresh failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Error event or error object reported by the vendor
    #[error("Vendor error ({code}): {message}")]
    Vendor { code: String, message: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("all channels are unavailable after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: Box<RelayError> },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Parse(e.to_string())
    }
}

impl RelayError {
    /// Machine-readable error type for client payloads
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_error",
            RelayError::Http(_) | RelayError::Transport { .. } => "transport_error",
            RelayError::Parse(_) => "parse_error",
            RelayError::Auth(_) => "auth_error",
            RelayError::Vendor { .. } => "vendor_error",
            RelayError::Validation(_) => "invalid_request_error",
            RelayError::NotFound(_) => "not_found",
            RelayError::Exhausted { .. } => "exhaustion_error",
            RelayError::Store(_) => "store_error",
        }
    }

    /// Transport failures may be retried on a different channel
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Http(e) => !e.is_builder(),
            RelayError::Transport { .. } => true,
            _ => false,
        }
    }

    /// Upstream status when the vendor answered with an error
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RelayError::Transport { status, .. } => Some(*status),
            RelayError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn exhausted(attempts: u32, last: RelayError) -> Self {
        RelayError::Exhausted {
            attempts,
            last: Box::new(last),
        }
    }
}
