//! User-Agent string sent with every API request.

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/fierce/querier";

/// Default User-Agent for API requests (identifies the tool and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("querier/{version} (+{PROJECT_UA_URL})")
}
