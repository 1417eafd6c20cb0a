//! Rate-limited, paginated query engine.
//!
//! This module issues GraphQL and REST queries against a GitHub-style API and
//! drives each one to a complete result:
//!
//! - [`QueryDocumentCache`] loads query documents and normalizes them to one line
//! - [`Transport`] performs single round trips ([`HttpTransport`] in production)
//! - [`classify`] labels every response
//! - [`RateLimitGuard`] tracks the credential's request budget
//! - [`RetryPolicy`] decides when a transient failure may be retried
//! - [`QueryEngine`] runs the retry loop and follows pagination
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use querier_core::query::{
//!     HttpTransport, Pagination, QueryEngine, QueryRequest, RetryPolicy, TransportSettings,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new("ghp_token", &TransportSettings::default())?);
//! let engine = QueryEngine::new(transport, RetryPolicy::default());
//!
//! let repos = engine
//!     .paginate_all(&QueryRequest::rest("/orgs/rust-lang/repos"), &Pagination::Links)
//!     .await?;
//! println!("{} repositories", repos.as_array().map_or(0, Vec::len));
//! # Ok(())
//! # }
//! ```

mod classify;
mod constants;
mod document;
mod engine;
mod error;
mod link;
mod pagination;
mod rate_limit;
mod request;
mod retry;
mod transport;

pub use classify::{Classification, classify};
pub use constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_GRAPHQL_URL, DEFAULT_MAX_ATTEMPTS, DEFAULT_REST_BASE_URL,
    DEFAULT_RETRY_DELAY, MAX_RESET_WAIT, MAX_RETRY_AFTER, READ_TIMEOUT_SECS, RESET_SAFETY_MARGIN,
    VERIFY_CREDENTIAL_QUERY,
};
pub use document::{DocumentSource, FsDocumentSource, QueryDocumentCache, normalize_query};
pub use engine::{Page, QueryEngine};
pub use error::{DocumentError, QueryError, TransientFailure, TransportError};
pub use link::{LinkMap, LinkParseError, parse_link_header};
pub use pagination::{PageAccumulator, Pagination};
pub use rate_limit::{RateLimitGuard, RateLimitStatus, now_epoch, parse_retry_after};
pub use request::{QueryMode, QueryRequest};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use transport::{HeaderMap, HttpTransport, RawResponse, Transport, TransportSettings};
