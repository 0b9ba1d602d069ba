//! Error types for route handlers and route registration.

use hyper::StatusCode;
use thiserror::Error;

use crate::hypervisor::HypervisorError;

/// Failures a route handler can report.
///
/// The router retries [`HandlerError::Transient`] and converts everything else
/// into a status code and a JSON `detail` body via [`HandlerError::status`].
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// A recoverable condition; the handler is re-run with a fresh response.
    #[error("{message}")]
    Transient {
        /// Human-readable description.
        message: String,
    },
    /// An unrecoverable condition, including exhausted transient failures.
    #[error("{message}")]
    Fatal {
        /// Human-readable description.
        message: String,
    },
    /// The request itself was unusable.
    #[error("{message}")]
    BadRequest {
        /// Human-readable description.
        message: String,
    },
    /// A hypervisor call failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl HandlerError {
    /// Creates a retryable error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a non-retryable error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Creates a client error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// HTTP status reported for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Hypervisor(HypervisorError::ShutdownTimeout { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Transient { .. } | Self::Fatal { .. } | Self::Hypervisor(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Failures raised while building the route table.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A route pattern is not a valid regular expression.
    #[error("invalid route pattern '{pattern}': {source}")]
    Pattern {
        /// Offending pattern.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: Box<regex::Error>,
    },
}
