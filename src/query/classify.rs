//! Response classification.
//!
//! Every [`RawResponse`] maps to exactly one [`Classification`], which the
//! retry loop turns into "return", "wait and retry" or "raise".

use serde_json::Value;
use tracing::{debug, instrument};

use super::rate_limit::reset_epoch_from_headers;
use super::request::QueryMode;
use super::transport::RawResponse;

/// What a response means for the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Usable payload (the parsed JSON body).
    Success(Value),
    /// 403/429; carries `x-ratelimit-reset` when the server sent one.
    RateLimited {
        /// HTTP status.
        status: u16,
        /// Reset time in seconds since the Unix epoch.
        reset_epoch: Option<u64>,
    },
    /// 202: the server accepted the request but is still computing it.
    AcceptedPending,
    /// 502/503, or a 2xx body that is not JSON.
    ServerError {
        /// HTTP status.
        status: u16,
    },
    /// Any other status >= 400, or 204.
    ClientErrorFatal {
        /// HTTP status.
        status: u16,
    },
    /// A GraphQL `errors` array with one opaque entry.
    GraphQlTransientError(Value),
    /// Any other GraphQL `errors` payload.
    GraphQlFatalError(Value),
}

impl Classification {
    /// Whether the response can be returned to the caller.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Classifies a response; the first matching row wins.
///
/// | Condition | Classification |
/// |-----------|----------------|
/// | 403, 429 | `RateLimited` |
/// | 202 | `AcceptedPending` |
/// | 502, 503 | `ServerError` |
/// | other >= 400, 204 | `ClientErrorFatal` |
/// | body not JSON | `ServerError` |
/// | GraphQL `errors` = `[{single-field object}]` | `GraphQlTransientError` |
/// | GraphQL `errors` otherwise | `GraphQlFatalError` |
/// | otherwise | `Success` |
///
/// A lone error object with a single field (typically just `message`) has no
/// `type`, `path` or `locations` and is what GitHub returns for internal
/// timeouts; errors with more structure describe a genuine query problem.
#[must_use]
#[instrument(skip(response), fields(status = response.status()))]
pub fn classify(response: &RawResponse, mode: QueryMode) -> Classification {
    let status = response.status();
    match status {
        403 | 429 => {
            return Classification::RateLimited {
                status,
                reset_epoch: reset_epoch_from_headers(response.headers()),
            };
        }
        202 => return Classification::AcceptedPending,
        502 | 503 => return Classification::ServerError { status },
        204 => return Classification::ClientErrorFatal { status },
        s if s >= 400 => return Classification::ClientErrorFatal { status },
        _ => {}
    }

    let body: Value = match serde_json::from_str(response.body()) {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "response body is not JSON");
            return Classification::ServerError { status };
        }
    };

    if mode == QueryMode::GraphQl
        && let Some(errors) = body.get("errors")
    {
        if is_opaque_single_error(errors) {
            return Classification::GraphQlTransientError(errors.clone());
        }
        return Classification::GraphQlFatalError(errors.clone());
    }

    Classification::Success(body)
}

fn is_opaque_single_error(errors: &Value) -> bool {
    match errors.as_array().map(Vec::as_slice) {
        Some([only]) => only.as_object().is_some_and(|fields| fields.len() == 1),
        _ => false,
    }
}
