//! Defaults for the query engine (endpoints, timeouts, retry and rate-limit pacing).

use std::time::Duration;

/// Default GraphQL endpoint.
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Default base URL that REST paths are appended to.
pub const DEFAULT_REST_BASE_URL: &str = "https://api.github.com";

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default HTTP read timeout (60 seconds; large GraphQL pages can be slow to compute).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Default number of attempts per logical request (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Fixed delay before retrying a transient failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Margin added on top of a rate-limit reset time before sending again.
pub const RESET_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Longest rate-limit reset wait accepted. The budget window is one hour;
/// resets further out are treated as malformed headers.
pub const MAX_RESET_WAIT: Duration = Duration::from_secs(2 * 3600);

/// How often a long rate-limit wait reports progress.
pub const RESET_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Longest single sleep between interrupt-flag checks.
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Query used to check that a credential is accepted by the GraphQL endpoint.
pub const VERIFY_CREDENTIAL_QUERY: &str = "query { viewer { login } }";
