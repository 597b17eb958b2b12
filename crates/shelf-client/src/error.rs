//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base URL could not be parsed or joined.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Server returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Nothing to generate: blank text and no backend context.
    #[error("Nothing to generate: text is empty")]
    EmptyPayload,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || matches!(self, Error::Api { status: 404, .. })
    }

    /// Check if this is a server error.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Api { status, .. } if *status >= 500)
    }

    /// Failures worth retrying: transport, undecodable bodies and 5xx.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Json(_)) || self.is_server_error()
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ErrorResponse {
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorResponse {
    /// Backend message, with the underlying cause appended when present.
    pub(crate) fn into_message(self) -> String {
        match self.error {
            Some(cause) if !cause.is_empty() => format!("{}: {}", self.message, cause),
            _ => self.message,
        }
    }
}
