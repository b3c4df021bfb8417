//! Error types for hookline.
//!
//! Every policy reports through the same [`Error`] enum. It is `Clone` so a
//! single in-flight result (deduplicated request, shared token refresh) can be
//! handed to every waiting caller.

use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::Response;

/// Main error type for hookline operations.
#[derive(Debug, Clone, Display, Error, From)]
pub enum Error {
    /// The transport answered with a status rejected by status validation.
    #[display("HTTP error {status}: {message}")]
    #[from(skip)]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
        /// The full failed response.
        #[error(not(source))]
        response: Box<Response>,
    },

    /// Network/connection errors, no response was received.
    #[display("connection error: {_0}")]
    #[from(skip)]
    Connection(#[error(not(source))] String),

    /// Request timeout.
    #[display("request timeout")]
    #[from(skip)]
    Timeout,

    /// Invalid request configuration.
    #[display("invalid request: {_0}")]
    #[from(skip)]
    InvalidRequest(#[error(not(source))] String),

    /// Body or query serialization error.
    #[display("serialization error: {_0}")]
    #[from(skip)]
    Serialization(#[error(not(source))] String),

    /// JSON deserialization error with path context.
    #[display("JSON deserialization error at '{path}': {message}")]
    #[from(skip)]
    JsonDeserialization {
        /// JSON path to the error (e.g., "user.address.city").
        path: String,
        /// Error message.
        message: String,
    },

    /// URL parsing error.
    #[display("invalid URL: {_0}")]
    #[from]
    InvalidUrl(url::ParseError),

    /// Bad group or conditional interceptor setup.
    #[display("validation error: {_0}")]
    #[from(skip)]
    Validation(#[error(not(source))] String),

    /// Operation on an unregistered group or interceptor.
    #[display("not found: {_0}")]
    #[from(skip)]
    NotFound(#[error(not(source))] String),

    /// Admission denied by the sliding-window rate limiter.
    #[display("rate limit exceeded: {limit} requests per {window:?}, retry after {retry_after:?}")]
    #[from(skip)]
    RateLimitExceeded {
        /// Maximum requests allowed in the window.
        limit: u32,
        /// Window length.
        window: Duration,
        /// Time until the oldest recorded request leaves the window.
        retry_after: Duration,
    },

    /// Malformed response from a collaborator (token refresh, batch endpoint).
    #[display("protocol error: {_0}")]
    #[from(skip)]
    Protocol(#[error(not(source))] String),

    /// The request was cancelled or its queue slot was torn down.
    #[display("request cancelled: {_0}")]
    #[from(skip)]
    Cancelled(#[error(not(source))] String),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_html_form::ser::Error> for Error {
    fn from(err: serde_html_form::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Create an HTTP error carrying the failed response.
    #[must_use]
    pub fn http(response: Response) -> Self {
        let status = response.status();
        let message = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("unexpected status")
            .to_string();
        Self::Http {
            status,
            message,
            response: Box::new(response),
        }
    }

    /// Create a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a JSON deserialization error with path context.
    #[must_use]
    pub fn json_deserialization(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JsonDeserialization {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the HTTP status code if the error carries a response.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The failed response, if one was received.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Http { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Returns `true` if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` if this is a connection error.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` if the request was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns `true` if the rate limiter denied admission.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Returns `true` if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Returns `true` if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }
}
