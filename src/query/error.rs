//! Error types for the query module.
//!
//! Every error that escapes the engine is terminal: retryable conditions are
//! resolved inside the retry loop, so a caller holding a [`QueryError`] has no
//! usable data for that query. Each variant carries enough context (status,
//! attempts, last body) to log a full diagnostic.

use std::fmt;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// Failures of a single network round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect or read timeout expired.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The request target could not be turned into a valid URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl TransportError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }
}

/// Errors loading a query document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document does not exist.
    #[error("query document '{path}' does not exist")]
    NotFound {
        /// The missing location.
        path: PathBuf,
    },

    /// The document exists but could not be read.
    #[error("IO error reading query document {path}: {source}")]
    Io {
        /// The location being read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl DocumentError {
    /// Creates a not-found error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an IO error, mapping `NotFound` IO errors to [`DocumentError::NotFound`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found(path);
        }
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// The last retryable failure seen before the attempt budget ran out.
#[derive(Debug, Clone, PartialEq)]
pub enum TransientFailure {
    /// Timeout or connection failure.
    Network {
        /// Rendered transport error.
        message: String,
    },
    /// 403/429 without usable reset information.
    RateLimited {
        /// The HTTP status code.
        status: u16,
    },
    /// 202: the remote is still computing the answer.
    AcceptedPending,
    /// 502/503, or a success status with an unparsable body.
    ServerError {
        /// The HTTP status code.
        status: u16,
    },
    /// A single opaque GraphQL error.
    GraphQl {
        /// The `errors` payload.
        errors: Value,
    },
}

impl TransientFailure {
    /// HTTP status associated with the failure, if one was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status } | Self::ServerError { status } => Some(*status),
            Self::AcceptedPending => Some(202),
            Self::GraphQl { .. } => Some(200),
            Self::Network { .. } => None,
        }
    }
}

impl fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { message } => write!(f, "transient network failure: {message}"),
            Self::RateLimited { status } => write!(f, "HTTP {status} rate limited"),
            Self::AcceptedPending => write!(f, "HTTP 202 accepted but not yet processed"),
            Self::ServerError { status } => write!(f, "HTTP {status} server error"),
            Self::GraphQl { errors } => write!(f, "transient GraphQL error {errors}"),
        }
    }
}

/// Terminal errors raised by the query engine.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A transport failure that retrying cannot fix (e.g. an invalid URL).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote rejected the request (4xx, or 204 with no body).
    #[error("HTTP {status} error response after {attempts} attempt(s)\n{body}")]
    ClientError {
        /// The HTTP status code.
        status: u16,
        /// Attempts made for this request.
        attempts: u32,
        /// The raw response body.
        body: String,
    },

    /// The GraphQL endpoint answered with errors that are not transient.
    #[error("GraphQL API error after {attempts} attempt(s)\n{errors}")]
    GraphQl {
        /// The `errors` payload.
        errors: Value,
        /// Attempts made for this request.
        attempts: u32,
        /// The raw response body.
        body: String,
    },

    /// Every allowed attempt ended in a transient failure.
    #[error("query attempted but failed {attempts} times; last failure: {last_failure}")]
    RetryBudgetExhausted {
        /// Attempts made (equals the configured maximum).
        attempts: u32,
        /// The failure that consumed the final attempt.
        last_failure: TransientFailure,
        /// The last raw body, when a response was received.
        body: Option<String>,
    },

    /// Pagination parameters are missing or inconsistent with the request mode.
    #[error("invalid query configuration: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// A successful response did not have the structure pagination relies on.
    #[error("unexpected response shape: {message}")]
    UnexpectedShape {
        /// What was missing.
        message: String,
    },

    /// The credential was rejected with HTTP 401.
    #[error("API token is not valid (HTTP 401)\n{body}")]
    InvalidCredential {
        /// The raw response body.
        body: String,
    },

    /// The query document could not be loaded.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// The interrupt flag was raised before the query completed.
    #[error("query cancelled")]
    Cancelled,
}

impl QueryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an unexpected-shape error.
    pub fn unexpected_shape(message: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            message: message.into(),
        }
    }

    /// Attempts made before the error was raised, when known.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::ClientError { attempts, .. }
            | Self::GraphQl { attempts, .. }
            | Self::RetryBudgetExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// HTTP status that triggered the error, when one was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status, .. } => Some(*status),
            Self::GraphQl { .. } => Some(200),
            Self::InvalidCredential { .. } => Some(401),
            Self::RetryBudgetExhausted { last_failure, .. } => last_failure.status(),
            _ => None,
        }
    }

    /// The last raw response body, when one was received.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. }
            | Self::GraphQl { body, .. }
            | Self::InvalidCredential { body } => Some(body),
            Self::RetryBudgetExhausted { body, .. } => body.as_deref(),
            _ => None,
        }
    }
}
