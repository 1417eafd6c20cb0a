//! The query engine: retry loop and pagination driver.
//!
//! [`QueryEngine`] owns a [`Transport`], a [`RetryPolicy`] and a handle to a
//! (possibly shared) [`RateLimitGuard`]. Each logical request runs
//! sequentially: admit, send, record quota, classify, then return, wait, or
//! raise. Pagination repeats that cycle per page with a fresh attempt budget.
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
//! let request = QueryRequest::graphql(
//!     "query($org: String!, $after: String) { organization(login: $org) { \
//!      repositories(first: 100, after: $after) { nodes { name } \
//!      pageInfo { hasNextPage endCursor } } } }",
//! )
//! .with_variable("org", "rust-lang")
//! .with_variable("after", serde_json::Value::Null);
//!
//! let pagination = Pagination::cursor("after", ["data", "organization", "repositories"]);
//! let data = engine.paginate_all(&request, &pagination).await?;
//! println!("{data:#}");
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::classify::{Classification, classify};
use super::constants::VERIFY_CREDENTIAL_QUERY;
use super::document::{DocumentSource, QueryDocumentCache};
use super::error::{QueryError, TransientFailure};
use super::pagination::{
    PageAccumulator, Pagination, array_items, graphql_data, merge_cursor_pages, next_link,
    read_cursor_page,
};
use super::rate_limit::{RateLimitGuard, parse_retry_after, pause, remaining_from_headers};
use super::request::{QueryMode, QueryRequest};
use super::retry::{RetryDecision, RetryPolicy, RetryState};
use super::transport::{HeaderMap, RawResponse, Transport};

/// One successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Parsed JSON body.
    pub body: Value,
    /// Response headers (lower-cased names).
    pub headers: HeaderMap,
    /// Attempts it took to obtain this page.
    pub attempts: u32,
}

/// Runs queries to completion against one credential.
#[derive(Clone)]
pub struct QueryEngine {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    rate_limit: Arc<RateLimitGuard>,
    interrupted: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("policy", &self.policy)
            .field("rate_limit", &self.rate_limit)
            .field("interruptible", &self.interrupted.is_some())
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Creates an engine with its own rate-limit guard.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            rate_limit: Arc::new(RateLimitGuard::new()),
            interrupted: None,
        }
    }

    /// Shares `guard` with other engines using the same credential.
    #[must_use]
    pub fn with_rate_limit_guard(mut self, guard: Arc<RateLimitGuard>) -> Self {
        self.rate_limit = guard;
        self
    }

    /// Sets the interrupt flag checked before every send and during every wait.
    #[must_use]
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the rate-limit guard.
    #[must_use]
    pub fn rate_limit_guard(&self) -> &Arc<RateLimitGuard> {
        &self.rate_limit
    }

    /// Runs a single-page query.
    ///
    /// GraphQL requests return the response's `data` member; REST requests
    /// return the parsed body.
    ///
    /// # Errors
    ///
    /// See [`QueryEngine::paginate_all`].
    pub async fn query(&self, request: &QueryRequest) -> Result<Value, QueryError> {
        self.paginate_all(request, &Pagination::None).await
    }

    /// Runs a query and follows continuations until the last page.
    ///
    /// Cursor pagination returns the first page's document with the
    /// connection's `nodes` replaced by every page's nodes and `pageInfo`
    /// removed. Link pagination returns the concatenated arrays.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Configuration`] before any network activity if
    ///   `pagination` does not fit `request`
    /// - [`QueryError::UnexpectedShape`] if a page lacks the expected structure
    /// - any error of [`QueryEngine::execute`], for any page
    #[instrument(skip_all, fields(mode = %request.mode()))]
    pub async fn paginate_all(
        &self,
        request: &QueryRequest,
        pagination: &Pagination,
    ) -> Result<Value, QueryError> {
        pagination.validate(request)?;

        let document = match pagination {
            Pagination::None => self.execute(request).await?.body,
            Pagination::Links => self.follow_links(request).await?,
            Pagination::Cursor { cursor_var, keys } => {
                self.follow_cursor(request, cursor_var, keys).await?
            }
        };

        match request.mode() {
            QueryMode::GraphQl => graphql_data(document),
            QueryMode::Rest => Ok(document),
        }
    }

    /// Resolves a query document through `cache`, then runs it.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Document`] if the document cannot be loaded, or
    /// any error of [`QueryEngine::paginate_all`].
    pub async fn query_from_file<S: DocumentSource>(
        &self,
        cache: &mut QueryDocumentCache<S>,
        location: &Path,
        variables: Map<String, Value>,
        pagination: &Pagination,
    ) -> Result<Value, QueryError> {
        let text = cache.resolve(location)?;
        let request = QueryRequest::graphql(text).with_variables(variables);
        self.paginate_all(&request, pagination).await
    }

    /// Checks that the credential is accepted by sending a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidCredential`] on HTTP 401, or any other
    /// error of [`QueryEngine::execute`].
    pub async fn verify_credential(&self) -> Result<(), QueryError> {
        match self.query(&QueryRequest::graphql(VERIFY_CREDENTIAL_QUERY)).await {
            Ok(data) => {
                let login = data.pointer("/viewer/login").and_then(Value::as_str);
                info!(login = login.unwrap_or("<unknown>"), "API token accepted");
                Ok(())
            }
            Err(QueryError::ClientError {
                status: 401, body, ..
            }) => Err(QueryError::InvalidCredential { body }),
            Err(e) => Err(e),
        }
    }

    /// Runs one logical request until it succeeds or fails terminally.
    ///
    /// Rate-limit waits never consume attempts. Timeouts, network failures,
    /// 202, 502/503 and single opaque GraphQL errors each consume one.
    ///
    /// # Errors
    ///
    /// - [`QueryError::ClientError`] / [`QueryError::GraphQl`] immediately on
    ///   fatal responses
    /// - [`QueryError::RetryBudgetExhausted`] after `max_attempts` transient failures
    /// - [`QueryError::Transport`] for an invalid target URL
    /// - [`QueryError::Cancelled`] if the interrupt flag is raised
    #[instrument(
        skip_all,
        fields(mode = %request.mode(), max_attempts = self.policy.max_attempts())
    )]
    pub async fn execute(&self, request: &QueryRequest) -> Result<Page, QueryError> {
        let interrupted = self.interrupted.as_deref();
        let mut state = self.policy.start();

        loop {
            self.check_interrupted()?;
            self.rate_limit.admit(interrupted).await?;
            self.check_interrupted()?;

            debug!(attempt = state.attempt(), "sending query");
            let response = match self.transport.send(request).await {
                Ok(response) => response,
                Err(e) if e.is_transient() => {
                    warn!(attempt = state.attempt(), error = %e, "transient network failure");
                    let failure = TransientFailure::Network {
                        message: e.to_string(),
                    };
                    self.back_off(&mut state, failure, None, None).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let quota = self.rate_limit.observe(&response);
            let classification = classify(&response, request.mode());

            if let Some(quota) = quota
                && quota.is_exhausted()
                && !classification.is_success()
            {
                info!(status = response.status(), "API usage limit reached during query");
                self.rate_limit.await_reset(quota.reset_epoch, interrupted).await?;
                continue;
            }

            match classification {
                Classification::Success(body) => {
                    debug!(attempts = state.attempt(), "query succeeded");
                    return Ok(Page {
                        body,
                        headers: response.headers().clone(),
                        attempts: state.attempt(),
                    });
                }
                Classification::RateLimited {
                    status,
                    reset_epoch,
                } => {
                    self.handle_rate_limited(&mut state, &response, status, reset_epoch)
                        .await?;
                }
                Classification::AcceptedPending => {
                    info!(attempt = state.attempt(), "query accepted but not yet processed");
                    let hint = retry_after(&response);
                    let failure = TransientFailure::AcceptedPending;
                    self.back_off(&mut state, failure, hint, Some(&response))
                        .await?;
                }
                Classification::ServerError { status } => {
                    warn!(attempt = state.attempt(), status, "server error");
                    let hint = retry_after(&response);
                    let failure = TransientFailure::ServerError { status };
                    self.back_off(&mut state, failure, hint, Some(&response))
                        .await?;
                }
                Classification::GraphQlTransientError(errors) => {
                    warn!(attempt = state.attempt(), %errors, "transient GraphQL error");
                    let hint = retry_after(&response);
                    let failure = TransientFailure::GraphQl { errors };
                    self.back_off(&mut state, failure, hint, Some(&response))
                        .await?;
                }
                Classification::ClientErrorFatal { status } => {
                    warn!(status, "request rejected");
                    return Err(QueryError::ClientError {
                        status,
                        attempts: state.attempt(),
                        body: response.body().to_string(),
                    });
                }
                Classification::GraphQlFatalError(errors) => {
                    warn!(%errors, "GraphQL query failed");
                    return Err(QueryError::GraphQl {
                        errors,
                        attempts: state.attempt(),
                        body: response.body().to_string(),
                    });
                }
            }
        }
    }

    /// 403/429 handling. Waits backed by explicit reset information are free;
    /// unexplained refusals go through the attempt budget.
    async fn handle_rate_limited(
        &self,
        state: &mut RetryState,
        response: &RawResponse,
        status: u16,
        reset_epoch: Option<u64>,
    ) -> Result<(), QueryError> {
        let interrupted = self.interrupted.as_deref();

        if let Some(delay) = retry_after(response) {
            let delay = delay.max(self.rate_limit.safety_margin());
            info!(status, delay_secs = delay.as_secs(), "rate limited; honouring Retry-After");
            return pause(delay, interrupted).await;
        }

        let remaining = remaining_from_headers(response.headers());
        if let Some(reset_epoch) = reset_epoch
            && remaining.is_none_or(|remaining| remaining == 0)
        {
            return self.rate_limit.await_reset(reset_epoch, interrupted).await;
        }

        let delay = self.policy.rate_limit_backoff(state);
        warn!(status, attempt = state.attempt(), "rate limited without reset information");
        self.back_off(
            state,
            TransientFailure::RateLimited { status },
            Some(delay),
            Some(response),
        )
        .await
    }

    /// Consumes an attempt and sleeps, or raises once the budget is spent.
    async fn back_off(
        &self,
        state: &mut RetryState,
        failure: TransientFailure,
        hint: Option<Duration>,
        response: Option<&RawResponse>,
    ) -> Result<(), QueryError> {
        match self.policy.on_transient(state, hint) {
            RetryDecision::Retry { delay, attempt } => {
                info!(
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    last_failure = %failure,
                    "retrying query"
                );
                pause(delay, self.interrupted.as_deref()).await
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(%reason, last_failure = %failure, "giving up on query");
                Err(QueryError::RetryBudgetExhausted {
                    attempts: state.attempt(),
                    last_failure: failure,
                    body: response.map(|r| r.body().to_string()),
                })
            }
        }
    }

    async fn follow_links(&self, request: &QueryRequest) -> Result<Value, QueryError> {
        let mut request = request.clone();
        let mut accumulator = PageAccumulator::new();

        loop {
            let page = self.execute(&request).await?;
            let next = next_link(&page.headers)?;
            if let Some(next) = &next
                && !self.transport.accepts_link(next)
            {
                return Err(QueryError::unexpected_shape(format!(
                    "next-page link '{next}' leaves the API origin"
                )));
            }
            if accumulator.pages() == 0 && next.is_none() {
                return Ok(page.body);
            }
            accumulator.absorb(array_items(page.body)?, next)?;

            let Some(next) = accumulator.continuation() else {
                break;
            };
            debug!(next = %next, "following next page link");
            request.set_target(next.to_string());
        }

        info!(pages = accumulator.pages(), items = accumulator.len(), "pagination complete");
        Ok(Value::Array(accumulator.into_items()))
    }

    async fn follow_cursor(
        &self,
        request: &QueryRequest,
        cursor_var: &str,
        keys: &[String],
    ) -> Result<Value, QueryError> {
        let mut request = request.clone();
        let mut accumulator = PageAccumulator::new();

        let first = self.execute(&request).await?.body;
        let mut page = read_cursor_page(&first, keys)?;
        loop {
            accumulator.absorb(page.nodes, page.continuation)?;
            let Some(cursor) = accumulator.continuation() else {
                break;
            };
            debug!(%cursor, "requesting next page");
            request.set_variable(cursor_var, Value::String(cursor.to_string()));
            let body = self.execute(&request).await?.body;
            page = read_cursor_page(&body, keys)?;
        }

        info!(pages = accumulator.pages(), items = accumulator.len(), "pagination complete");
        merge_cursor_pages(first, keys, accumulator.into_items())
    }

    fn check_interrupted(&self) -> Result<(), QueryError> {
        match &self.interrupted {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(QueryError::Cancelled),
            _ => Ok(()),
        }
    }
}

fn retry_after(response: &RawResponse) -> Option<Duration> {
    response.header("retry-after").and_then(parse_retry_after)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::query::error::TransportError;
    use crate::query::rate_limit::now_epoch;

    /// Replays scripted responses and records every request it sees.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        seen: Mutex<Vec<QueryRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn seen(&self) -> Vec<QueryRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &QueryRequest) -> Result<RawResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("transport called more often than scripted")
        }

        fn accepts_link(&self, url: &str) -> bool {
            url.starts_with("https://api.github.com/")
        }
    }

    fn ok(body: Value) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(200, Vec::<(String, String)>::new(), body.to_string()))
    }

    fn status(code: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(code, Vec::<(String, String)>::new(), body))
    }

    fn with_headers(
        code: u16,
        headers: &[(&str, String)],
        body: &str,
    ) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(
            code,
            headers.iter().map(|(k, v)| (*k, v.clone())),
            body,
        ))
    }

    fn engine(transport: &Arc<ScriptedTransport>, max_attempts: u32) -> QueryEngine {
        QueryEngine::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            RetryPolicy::new(max_attempts, Duration::from_secs(3)),
        )
    }

    fn graphql() -> QueryRequest {
        QueryRequest::graphql("query { viewer { login } }")
    }

    fn viewer() -> Value {
        json!({"data": {"viewer": {"login": "octocat"}}})
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_data_member() {
        let transport = ScriptedTransport::new(vec![ok(viewer())]);
        let data = engine(&transport, 3).query(&graphql()).await.unwrap();
        assert_eq!(data, json!({"viewer": {"login": "octocat"}}));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_with_reset_waits_without_consuming_attempts() {
        let reset = (now_epoch() + 5).to_string();
        let transport = ScriptedTransport::new(vec![
            with_headers(429, &[("x-ratelimit-reset", reset.clone())], ""),
            with_headers(
                403,
                &[("x-ratelimit-reset", reset), ("x-ratelimit-remaining", "0".into())],
                "",
            ),
            ok(viewer()),
        ]);
        // A single attempt would be exhausted by any counted failure
        let engine = engine(&transport, 1);

        let start = Instant::now();
        let page = engine.execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(page.attempts, 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_with_absurd_reset_is_unexpected_shape() {
        let transport = ScriptedTransport::new(vec![with_headers(
            429,
            &[
                ("x-ratelimit-limit", "5000".into()),
                ("x-ratelimit-remaining", "0".into()),
                ("x-ratelimit-reset", u64::MAX.to_string()),
            ],
            "",
        )]);
        let err = engine(&transport, 3).execute(&graphql()).await.unwrap_err();
        assert!(matches!(err, QueryError::UnexpectedShape { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_with_retry_after_is_free() {
        let transport = ScriptedTransport::new(vec![
            with_headers(429, &[("retry-after", "7".into())], ""),
            ok(viewer()),
        ]);
        let start = Instant::now();
        let page = engine(&transport, 1).execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(page.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_without_reset_info_counts_and_scales() {
        let transport =
            ScriptedTransport::new(vec![status(429, ""), status(429, ""), ok(viewer())]);
        let start = Instant::now();
        let page = engine(&transport, 3).execute(&graphql()).await.unwrap();
        // 3s after attempt 1, 6s after attempt 2
        assert!(start.elapsed() >= Duration::from_secs(9));
        assert_eq!(page.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_with_budget_left_exhausts_attempts() {
        let reset = (now_epoch() + 3600).to_string();
        let forbidden = || {
            with_headers(
                403,
                &[
                    ("x-ratelimit-limit", "5000".into()),
                    ("x-ratelimit-remaining", "4999".into()),
                    ("x-ratelimit-reset", reset.clone()),
                ],
                r#"{"message":"Resource not accessible"}"#,
            )
        };
        let transport = ScriptedTransport::new(vec![forbidden(), forbidden()]);
        let err = engine(&transport, 2).execute(&graphql()).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::RetryBudgetExhausted {
                attempts: 2,
                last_failure: TransientFailure::RateLimited { status: 403 },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_budget_before_success() {
        let transport = ScriptedTransport::new(vec![
            status(502, "bad gateway"),
            status(503, "unavailable"),
            status(502, "bad gateway again"),
            ok(viewer()),
        ]);
        let err = engine(&transport, 3).execute(&graphql()).await.unwrap_err();

        match err {
            QueryError::RetryBudgetExhausted {
                attempts,
                last_failure,
                body,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_failure, TransientFailure::ServerError { status: 502 });
                assert_eq!(body.as_deref(), Some("bad gateway again"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The scripted success was never requested
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_between_transient_failures() {
        let transport = ScriptedTransport::new(vec![status(202, "{}"), ok(viewer())]);
        let start = Instant::now();
        let page = engine(&transport, 5).execute(&graphql()).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
        assert_eq!(page.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_fixed_delay() {
        let transport = ScriptedTransport::new(vec![
            with_headers(503, &[("retry-after", "20".into())], ""),
            ok(viewer()),
        ]);
        let start = Instant::now();
        engine(&transport, 5).execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_raised_without_retry() {
        let transport = ScriptedTransport::new(vec![status(404, r#"{"message":"Not Found"}"#)]);
        let err = engine(&transport, 10)
            .execute(&QueryRequest::rest("/repos/octo/missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::ClientError {
                status: 404,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(err.body(), Some(r#"{"message":"Not Found"}"#));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_graphql_error_is_retried() {
        let transport = ScriptedTransport::new(vec![
            ok(json!({"errors": [{"message": "Something went wrong"}]})),
            ok(viewer()),
        ]);
        let page = engine(&transport, 3).execute(&graphql()).await.unwrap();
        assert_eq!(page.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_graphql_errors_are_fatal() {
        let transport = ScriptedTransport::new(vec![ok(json!({
            "errors": [{"message": "a"}, {"message": "b"}]
        }))]);
        let err = engine(&transport, 3).execute(&graphql()).await.unwrap_err();
        assert!(matches!(err, QueryError::GraphQl { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_consume_attempts() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::timeout("https://api.github.com/graphql")),
            Err(TransportError::timeout("https://api.github.com/graphql")),
        ]);
        let err = engine(&transport, 2).execute(&graphql()).await.unwrap_err();
        match err {
            QueryError::RetryBudgetExhausted {
                attempts,
                last_failure: TransientFailure::Network { message },
                body,
            } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timeout"));
                assert!(body.is_none());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url_is_fatal() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::invalid_url("::"))]);
        let err = engine(&transport, 5).execute(&graphql()).await.unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::InvalidUrl { .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_on_failure_waits_for_reset_for_free() {
        let reset = (now_epoch() + 4).to_string();
        let transport = ScriptedTransport::new(vec![
            with_headers(
                502,
                &[
                    ("x-ratelimit-limit", "5000".into()),
                    ("x-ratelimit-remaining", "0".into()),
                    ("x-ratelimit-reset", reset),
                ],
                "",
            ),
            ok(viewer()),
        ]);
        let start = Instant::now();
        let page = engine(&transport, 1).execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(page.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_that_spends_quota_is_kept_and_next_request_waits() {
        let reset = now_epoch() + 6;
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(
                200,
                [
                    ("x-ratelimit-limit", "5000".to_string()),
                    ("x-ratelimit-remaining", "0".to_string()),
                    ("x-ratelimit-reset", reset.to_string()),
                ],
                viewer().to_string(),
            )),
            ok(viewer()),
        ]);
        let engine = engine(&transport, 3);

        let start = Instant::now();
        engine.execute(&graphql()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        engine.execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_guard_blocks_sibling_engine() {
        let reset = now_epoch() + 5;
        let spender = ScriptedTransport::new(vec![Ok(RawResponse::new(
            200,
            [
                ("x-ratelimit-limit", "5000".to_string()),
                ("x-ratelimit-remaining", "0".to_string()),
                ("x-ratelimit-reset", reset.to_string()),
            ],
            viewer().to_string(),
        ))]);
        let sibling = ScriptedTransport::new(vec![ok(viewer())]);

        let guard = Arc::new(RateLimitGuard::new());
        let first = engine(&spender, 3).with_rate_limit_guard(Arc::clone(&guard));
        let second = engine(&sibling, 3).with_rate_limit_guard(guard);

        let start = Instant::now();
        first.execute(&graphql()).await.unwrap();
        second.execute(&graphql()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_pagination_merges_nodes() {
        let page = |nodes: Value, has_next: bool, cursor: Value| {
            ok(json!({
                "data": {"repo": {"items": {
                    "nodes": nodes,
                    "pageInfo": {"hasNextPage": has_next, "endCursor": cursor}
                }}}
            }))
        };
        let transport = ScriptedTransport::new(vec![
            page(json!(["A", "B"]), true, json!("c1")),
            page(json!(["C"]), false, json!("c2")),
        ]);
        let request = QueryRequest::graphql(
            "query($after: String) { repo { items(after: $after) { nodes } } }",
        )
        .with_variable("after", Value::Null);

        let data = engine(&transport, 3)
            .paginate_all(&request, &Pagination::cursor("after", ["data", "repo", "items"]))
            .await
            .unwrap();

        assert_eq!(data, json!({"repo": {"items": {"nodes": ["A", "B", "C"]}}}));
        let seen = transport.seen();
        assert_eq!(seen[0].variables()["after"], Value::Null);
        assert_eq!(seen[1].variables()["after"], json!("c1"));
        // The caller's request is untouched
        assert_eq!(request.variables()["after"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_pagination_missing_page_info_is_unexpected_shape() {
        let transport =
            ScriptedTransport::new(vec![ok(json!({"data": {"repo": {"items": {"nodes": []}}}}))]);
        let err = engine(&transport, 3)
            .paginate_all(&graphql(), &Pagination::cursor("after", ["data", "repo", "items"]))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UnexpectedShape { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pagination_retry_budget_is_per_page() {
        let page = |nodes: Value, has_next: bool, cursor: &str| {
            ok(json!({
                "data": {"c": {
                    "nodes": nodes,
                    "pageInfo": {"hasNextPage": has_next, "endCursor": cursor}
                }}
            }))
        };
        let transport = ScriptedTransport::new(vec![
            status(502, ""),
            page(json!([1]), true, "c1"),
            status(502, ""),
            page(json!([2]), false, "c2"),
        ]);
        let data = engine(&transport, 2)
            .paginate_all(&graphql(), &Pagination::cursor("after", ["data", "c"]))
            .await
            .unwrap();
        assert_eq!(data, json!({"c": {"nodes": [1, 2]}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_pagination_concatenates_pages() {
        let transport = ScriptedTransport::new(vec![
            with_headers(
                200,
                &[("link", r#"<https://api.github.com/user/repos?page=2>; rel="next""#.into())],
                r#"[{"id":1},{"id":2}]"#,
            ),
            with_headers(
                200,
                &[("link", r#"<https://api.github.com/user/repos?page=1>; rel="first""#.into())],
                r#"[{"id":3}]"#,
            ),
        ]);
        let data = engine(&transport, 3)
            .paginate_all(&QueryRequest::rest("/user/repos"), &Pagination::Links)
            .await
            .unwrap();
        assert_eq!(data, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        assert_eq!(transport.seen()[1].text(), "https://api.github.com/user/repos?page=2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_pagination_refuses_foreign_origin() {
        let transport = ScriptedTransport::new(vec![with_headers(
            200,
            &[("link", r#"<https://collector.example.net/steal?page=2>; rel="next""#.into())],
            r#"[{"id":1}]"#,
        )]);
        let err = engine(&transport, 3)
            .paginate_all(&QueryRequest::rest("/user/repos"), &Pagination::Links)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UnexpectedShape { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_pagination_single_non_array_page_returned_as_is() {
        let transport = ScriptedTransport::new(vec![ok(json!({"login": "octocat"}))]);
        let data = engine(&transport, 3)
            .paginate_all(&QueryRequest::rest("/user"), &Pagination::Links)
            .await
            .unwrap();
        assert_eq!(data, json!({"login": "octocat"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_pagination_non_array_with_more_pages_is_unexpected_shape() {
        let transport = ScriptedTransport::new(vec![with_headers(
            200,
            &[("link", r#"<https://api.github.com/x?page=2>; rel="next""#.into())],
            r#"{"total_count":2,"items":[]}"#,
        )]);
        let err = engine(&transport, 3)
            .paginate_all(&QueryRequest::rest("/x"), &Pagination::Links)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UnexpectedShape { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_send_nothing() {
        let transport = ScriptedTransport::new(vec![]);
        let engine = engine(&transport, 3);

        let err = engine
            .paginate_all(
                &QueryRequest::rest("/user/repos"),
                &Pagination::cursor("after", ["data"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Configuration { .. }));

        let err = engine
            .paginate_all(&graphql(), &Pagination::cursor("", ["data"]))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Configuration { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_credential_maps_unauthorized() {
        let transport =
            ScriptedTransport::new(vec![status(401, r#"{"message":"Bad credentials"}"#)]);
        let err = engine(&transport, 3).verify_credential().await.unwrap_err();
        match err {
            QueryError::InvalidCredential { body } => assert!(body.contains("Bad credentials")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_credential_accepts_valid_token() {
        let transport = ScriptedTransport::new(vec![ok(viewer())]);
        engine(&transport, 3).verify_credential().await.unwrap();
        assert_eq!(transport.seen()[0].text(), VERIFY_CREDENTIAL_QUERY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_flag_cancels_before_send() {
        let transport = ScriptedTransport::new(vec![ok(viewer())]);
        let flag = Arc::new(AtomicBool::new(true));
        let err = engine(&transport, 3)
            .with_interrupt_flag(flag)
            .execute(&graphql())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flag_raised_during_backoff_cancels_wait() {
        let transport = ScriptedTransport::new(vec![status(502, ""), ok(viewer())]);
        let flag = Arc::new(AtomicBool::new(false));
        let engine = QueryEngine::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            RetryPolicy::new(5, Duration::from_secs(600)),
        )
        .with_interrupt_flag(Arc::clone(&flag));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let err = engine.execute(&graphql()).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_from_file_uses_cache() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("viewer.gql");
        std::fs::write(&path, "query {\n  # me\n  viewer { login }\n}\n").unwrap();

        let transport = ScriptedTransport::new(vec![ok(viewer()), ok(viewer())]);
        let engine = engine(&transport, 3);
        let mut cache = QueryDocumentCache::new();

        for _ in 0..2 {
            let data = engine
                .query_from_file(&mut cache, &path, Map::new(), &Pagination::None)
                .await
                .unwrap();
            assert_eq!(data["viewer"]["login"], json!("octocat"));
        }
        assert_eq!(transport.seen()[0].text(), "query { viewer { login } }");
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_from_missing_file_is_document_error() {
        let transport = ScriptedTransport::new(vec![]);
        let mut cache = QueryDocumentCache::new();
        let err = engine(&transport, 3)
            .query_from_file(
                &mut cache,
                Path::new("/no/such/query.gql"),
                Map::new(),
                &Pagination::None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Document(_)));
        assert_eq!(transport.calls(), 0);
    }
}
