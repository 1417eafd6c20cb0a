//! Single network round trips.
//!
//! [`Transport`] is the seam between the engine and the network. The
//! production implementation, [`HttpTransport`], wraps a reqwest client with
//! connect and read timeouts and a bearer credential. It performs exactly one
//! request per [`Transport::send`] call and never retries; classification and
//! retry belong to the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap as ReqwestHeaderMap};
use serde_json::json;
use tracing::{debug, instrument, trace};
use url::{Origin, Url};

use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_GRAPHQL_URL, DEFAULT_REST_BASE_URL, READ_TIMEOUT_SECS,
};
use super::error::TransportError;
use super::request::{QueryMode, QueryRequest};
use crate::user_agent;

/// Response headers keyed by lower-cased name.
pub type HeaderMap = BTreeMap<String, String>;

/// Status, headers and body of one round trip. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: String,
}

impl RawResponse {
    /// Creates a response, lower-casing header names.
    ///
    /// Repeated names are joined with `", "` as HTTP permits for list-valued headers.
    #[must_use]
    pub fn new<I, K, V>(status: u16, headers: I, body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut normalized = HeaderMap::new();
        for (name, value) in headers {
            let name = name.as_ref().to_ascii_lowercase();
            let value = value.into();
            normalized
                .entry(name)
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        Self {
            status,
            headers: normalized,
            body: body.into(),
        }
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns all headers (lower-cased names).
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the raw body text.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Performs one network round trip for a request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` once and returns whatever the server answered.
    ///
    /// Non-2xx statuses are *not* errors at this layer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the connect or read timeout
    /// expires, [`TransportError::Network`] for other network failures, and
    /// [`TransportError::InvalidUrl`] when no valid target URL can be built.
    async fn send(&self, request: &QueryRequest) -> Result<RawResponse, TransportError>;

    /// Whether a next-page link may be requested with this transport's credential.
    ///
    /// Only links on the origin (scheme, host, port) of the REST base URL qualify.
    fn accepts_link(&self, url: &str) -> bool;
}

/// Endpoint and timeout settings for [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// GraphQL endpoint URL.
    pub graphql_url: String,
    /// Base URL that REST paths are appended to.
    pub rest_base_url: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request read timeout.
    pub read_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }
}

/// reqwest-backed transport with a bearer credential.
///
/// Created once and reused so connections are pooled across pages.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    graphql_url: Url,
    rest_base_url: String,
    rest_origin: Origin,
    token: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("graphql_url", &self.graphql_url.as_str())
            .field("rest_base_url", &self.rest_base_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport for `token` with the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if an endpoint is not a valid
    /// URL, or [`TransportError::Network`] if the HTTP client cannot be built.
    #[instrument(level = "debug", skip(token))]
    pub fn new(
        token: impl Into<String>,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let graphql_url = Url::parse(&settings.graphql_url)
            .map_err(|_| TransportError::invalid_url(&settings.graphql_url))?;
        let rest_origin = Url::parse(&settings.rest_base_url)
            .map_err(|_| TransportError::invalid_url(&settings.rest_base_url))?
            .origin();

        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .user_agent(user_agent::default_user_agent())
            .gzip(true)
            .build()
            .map_err(|e| TransportError::network(&settings.graphql_url, e))?;

        Ok(Self {
            client,
            graphql_url,
            rest_base_url: settings.rest_base_url.trim_end_matches('/').to_string(),
            rest_origin,
            token: token.into(),
        })
    }

    /// Resolves the URL a request is sent to.
    fn target_url(&self, request: &QueryRequest) -> Result<Url, TransportError> {
        match request.mode() {
            QueryMode::GraphQl => Ok(self.graphql_url.clone()),
            QueryMode::Rest if request.is_absolute_target() => {
                Url::parse(request.text()).map_err(|_| TransportError::invalid_url(request.text()))
            }
            QueryMode::Rest => {
                let path = request.text();
                let joined = if path.starts_with('/') {
                    format!("{}{path}", self.rest_base_url)
                } else {
                    format!("{}/{path}", self.rest_base_url)
                };
                Url::parse(&joined).map_err(|_| TransportError::invalid_url(joined))
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(mode = %request.mode()))]
    async fn send(&self, request: &QueryRequest) -> Result<RawResponse, TransportError> {
        let url = self.target_url(request)?;
        debug!(url = %url, "sending request");

        let mut builder = match request.mode() {
            QueryMode::GraphQl => self.client.post(url.clone()).json(&json!({
                "query": request.text(),
                "variables": request.variables(),
            })),
            QueryMode::Rest => self.client.get(url.clone()),
        };
        builder = builder.header(AUTHORIZATION, format!("bearer {}", self.token));
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(url.as_str(), e))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(url.as_str(), e))?;

        trace!(status, ?headers, body_len = body.len(), "received response");
        Ok(RawResponse::new(status, headers, body))
    }

    fn accepts_link(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|url| url.origin() == self.rest_origin)
    }
}

fn collect_headers(headers: &ReqwestHeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(url)
    } else {
        TransportError::network(url, error)
    }
}
