//! Multi-page aggregation.
//!
//! Two continuation styles are supported:
//!
//! - **Cursor** (GraphQL): `keys` locates a connection object
//!   `{nodes: [...], pageInfo: {hasNextPage, endCursor}}` in each response.
//!   The next page is requested by setting the cursor variable to `endCursor`.
//! - **Links** (REST): the `Link` response header names the next page with
//!   `rel="next"`; that URL is requested verbatim, provided it is on the
//!   REST base URL's origin.
//!
//! This module holds the pure parts (validation, page extraction, merging).
//! The request loop lives in [`QueryEngine::paginate_all`](super::QueryEngine::paginate_all).

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::error::QueryError;
use super::link::parse_link_header;
use super::request::{QueryMode, QueryRequest};
use super::transport::HeaderMap;

/// How a query continues across pages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Pagination {
    /// Single page.
    #[default]
    None,
    /// Follow `rel="next"` links (REST only).
    Links,
    /// Follow `pageInfo.endCursor` (GraphQL only).
    Cursor {
        /// Variable the cursor is written to, e.g. `after`.
        cursor_var: String,
        /// Path from the document root to the connection object.
        keys: Vec<String>,
    },
}

impl Pagination {
    /// Creates cursor pagination.
    ///
    /// ```
    /// use querier_core::query::Pagination;
    ///
    /// let pagination = Pagination::cursor("after", ["data", "organization", "repositories"]);
    /// assert!(matches!(pagination, Pagination::Cursor { .. }));
    /// ```
    #[must_use]
    pub fn cursor<I, K>(cursor_var: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::Cursor {
            cursor_var: cursor_var.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks that the pagination parameters fit `request`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Configuration`] when cursor pagination is used
    /// without a GraphQL request, cursor variable or key path, or when link
    /// pagination is used with a GraphQL request.
    pub fn validate(&self, request: &QueryRequest) -> Result<(), QueryError> {
        match self {
            Self::None => Ok(()),
            Self::Links => {
                if request.mode() != QueryMode::Rest {
                    return Err(QueryError::configuration(
                        "link pagination requires a REST request",
                    ));
                }
                Ok(())
            }
            Self::Cursor { cursor_var, keys } => {
                if request.mode() != QueryMode::GraphQl {
                    return Err(QueryError::configuration(
                        "cursor pagination requires a GraphQL request",
                    ));
                }
                if cursor_var.trim().is_empty() {
                    return Err(QueryError::configuration(
                        "cursor pagination requires a cursor variable name",
                    ));
                }
                if keys.is_empty() {
                    return Err(QueryError::configuration(
                        "cursor pagination requires the key path to the paginated connection",
                    ));
                }
                if keys.iter().any(|key| key.trim().is_empty()) {
                    return Err(QueryError::configuration(format!(
                        "empty segment in pagination key path '{}'",
                        keys.join(".")
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Items merged so far plus the continuation for the next page.
#[derive(Debug, Clone, Default)]
pub struct PageAccumulator {
    merged: Vec<Value>,
    continuation: Option<String>,
    seen: HashSet<String>,
    exhausted: bool,
    pages: usize,
}

impl PageAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one page's items and records its continuation.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnexpectedShape`] if called after the last page,
    /// or if the continuation was already seen (a page would be requested
    /// again and its items merged twice).
    pub fn absorb(
        &mut self,
        items: Vec<Value>,
        continuation: Option<String>,
    ) -> Result<(), QueryError> {
        if self.exhausted {
            return Err(QueryError::unexpected_shape(
                "page received after pagination was exhausted",
            ));
        }
        if let Some(next) = &continuation
            && !self.seen.insert(next.clone())
        {
            return Err(QueryError::unexpected_shape(format!(
                "pagination revisited continuation '{next}'"
            )));
        }

        self.pages += 1;
        debug!(
            page = self.pages,
            items = items.len(),
            has_next = continuation.is_some(),
            "merged page"
        );
        self.merged.extend(items);
        self.exhausted = continuation.is_none();
        self.continuation = continuation;
        Ok(())
    }

    /// Token for the next page, if any.
    #[must_use]
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Whether the last page has been absorbed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pages absorbed so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Items merged so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.merged.len()
    }

    /// Whether no items have been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Consumes the accumulator, returning the merged items in page order.
    #[must_use]
    pub fn into_items(self) -> Vec<Value> {
        self.merged
    }
}

/// GraphQL `PageInfo` fields used for continuation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

/// Nodes and continuation read from one cursor-paginated response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CursorPage {
    pub(crate) nodes: Vec<Value>,
    pub(crate) continuation: Option<String>,
}

/// Reads the connection at `keys` in `document`.
pub(crate) fn read_cursor_page(
    document: &Value,
    keys: &[String],
) -> Result<CursorPage, QueryError> {
    let connection = connection(document, keys)?;
    let path = keys.join(".");

    let nodes = connection
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| QueryError::unexpected_shape(format!("no 'nodes' array at '{path}'")))?
        .clone();
    let page_info = connection
        .get("pageInfo")
        .ok_or_else(|| QueryError::unexpected_shape(format!("no 'pageInfo' object at '{path}'")))?;
    let page_info = PageInfo::deserialize(page_info).map_err(|e| {
        QueryError::unexpected_shape(format!("invalid 'pageInfo' at '{path}': {e}"))
    })?;

    let continuation = if page_info.has_next_page {
        let cursor = page_info.end_cursor.ok_or_else(|| {
            QueryError::unexpected_shape(format!(
                "'hasNextPage' is true but 'pageInfo.endCursor' is missing at '{path}'"
            ))
        })?;
        Some(cursor)
    } else {
        None
    };

    Ok(CursorPage {
        nodes,
        continuation,
    })
}

/// Replaces the connection's `nodes` with `merged` and removes its `pageInfo`.
pub(crate) fn merge_cursor_pages(
    mut document: Value,
    keys: &[String],
    merged: Vec<Value>,
) -> Result<Value, QueryError> {
    let connection = connection_mut(&mut document, keys)?;
    connection.insert("nodes".to_string(), Value::Array(merged));
    connection.shift_remove("pageInfo");
    Ok(document)
}

fn connection<'a>(
    document: &'a Value,
    keys: &[String],
) -> Result<&'a Map<String, Value>, QueryError> {
    let mut current = document;
    for (depth, key) in keys.iter().enumerate() {
        current = current.get(key).ok_or_else(|| missing_key(keys, depth))?;
    }
    current.as_object().ok_or_else(|| not_an_object(keys))
}

fn connection_mut<'a>(
    document: &'a mut Value,
    keys: &[String],
) -> Result<&'a mut Map<String, Value>, QueryError> {
    let mut current = document;
    for (depth, key) in keys.iter().enumerate() {
        current = current.get_mut(key).ok_or_else(|| missing_key(keys, depth))?;
    }
    current.as_object_mut().ok_or_else(|| not_an_object(keys))
}

fn not_an_object(keys: &[String]) -> QueryError {
    QueryError::unexpected_shape(format!("'{}' is not an object", keys.join(".")))
}

fn missing_key(keys: &[String], depth: usize) -> QueryError {
    QueryError::unexpected_shape(format!(
        "missing key '{}' in path '{}'",
        keys[depth],
        keys[..=depth].join(".")
    ))
}

/// URL of the next page from the `Link` header, if any.
pub(crate) fn next_link(headers: &HeaderMap) -> Result<Option<String>, QueryError> {
    let Some(header) = headers.get("link") else {
        return Ok(None);
    };
    let mut links =
        parse_link_header(header).map_err(|e| QueryError::unexpected_shape(e.to_string()))?;
    Ok(links.remove("next"))
}

/// Items of a link-paginated page, which must be a JSON array.
pub(crate) fn array_items(body: Value) -> Result<Vec<Value>, QueryError> {
    match body {
        Value::Array(items) => Ok(items),
        other => Err(QueryError::unexpected_shape(format!(
            "paginated REST response is not an array (got {})",
            kind_of(&other)
        ))),
    }
}

/// The `data` member of a GraphQL response document.
pub(crate) fn graphql_data(document: Value) -> Result<Value, QueryError> {
    match document {
        Value::Object(mut fields) => fields
            .shift_remove("data")
            .ok_or_else(|| QueryError::unexpected_shape("GraphQL response has no 'data' member")),
        other => Err(QueryError::unexpected_shape(format!(
            "GraphQL response is not an object (got {})",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn keys(path: &str) -> Vec<String> {
        path.split('.').map(str::to_string).collect()
    }

    fn repo_page(nodes: Value, has_next: bool, cursor: Value) -> Value {
        json!({
            "data": {
                "repo": {
                    "name": "octo",
                    "items": {
                        "totalCount": 3,
                        "nodes": nodes,
                        "pageInfo": {"hasNextPage": has_next, "endCursor": cursor}
                    }
                }
            }
        })
    }

    #[test]
    fn test_validate_cursor_requires_graphql_var_and_keys() {
        let graphql = QueryRequest::graphql("query { x }");
        let rest = QueryRequest::rest("/user/repos");

        assert!(Pagination::cursor("after", ["data", "x"]).validate(&graphql).is_ok());
        for (pagination, request) in [
            (Pagination::cursor("after", ["data", "x"]), &rest),
            (Pagination::cursor("", ["data", "x"]), &graphql),
            (Pagination::cursor("after", Vec::<String>::new()), &graphql),
            (Pagination::cursor("after", ["data", ""]), &graphql),
        ] {
            assert!(
                matches!(pagination.validate(request), Err(QueryError::Configuration { .. })),
                "{pagination:?}"
            );
        }
    }

    #[test]
    fn test_validate_links_requires_rest() {
        assert!(Pagination::Links.validate(&QueryRequest::rest("/user/repos")).is_ok());
        assert!(matches!(
            Pagination::Links.validate(&QueryRequest::graphql("query { x }")),
            Err(QueryError::Configuration { .. })
        ));
        assert!(Pagination::None.validate(&QueryRequest::graphql("q")).is_ok());
    }

    #[test]
    fn test_accumulator_merges_in_order_and_exhausts() {
        let mut acc = PageAccumulator::new();
        acc.absorb(vec![json!("A"), json!("B")], Some("c1".to_string())).unwrap();
        assert_eq!(acc.continuation(), Some("c1"));
        assert!(!acc.is_exhausted());

        acc.absorb(vec![json!("C")], None).unwrap();
        assert!(acc.is_exhausted());
        assert_eq!(acc.pages(), 2);
        assert_eq!(acc.into_items(), vec![json!("A"), json!("B"), json!("C")]);
    }

    #[test]
    fn test_accumulator_rejects_stalled_continuation() {
        let mut acc = PageAccumulator::new();
        acc.absorb(vec![json!(1)], Some("c1".to_string())).unwrap();
        let result = acc.absorb(vec![json!(2)], Some("c1".to_string()));
        assert!(matches!(result, Err(QueryError::UnexpectedShape { .. })));
    }

    #[test]
    fn test_accumulator_rejects_cycling_continuations() {
        let mut acc = PageAccumulator::new();
        acc.absorb(vec![json!(1)], Some("c1".to_string())).unwrap();
        acc.absorb(vec![json!(2)], Some("c2".to_string())).unwrap();
        let result = acc.absorb(vec![json!(1)], Some("c1".to_string()));
        assert!(matches!(result, Err(QueryError::UnexpectedShape { .. })));
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_accumulator_rejects_page_after_exhaustion() {
        let mut acc = PageAccumulator::new();
        acc.absorb(vec![], None).unwrap();
        assert!(acc.absorb(vec![json!(1)], None).is_err());
    }

    #[test]
    fn test_read_cursor_page_with_next() {
        let page = repo_page(json!(["A", "B"]), true, json!("c1"));
        let read = read_cursor_page(&page, &keys("data.repo.items")).unwrap();
        assert_eq!(read.nodes, vec![json!("A"), json!("B")]);
        assert_eq!(read.continuation.as_deref(), Some("c1"));
    }

    #[test]
    fn test_read_cursor_page_last_page_allows_null_cursor() {
        let page = repo_page(json!([]), false, Value::Null);
        let read = read_cursor_page(&page, &keys("data.repo.items")).unwrap();
        assert!(read.nodes.is_empty());
        assert!(read.continuation.is_none());
    }

    #[test]
    fn test_read_cursor_page_shape_errors() {
        let page = repo_page(json!(["A"]), true, Value::Null);
        let err = read_cursor_page(&page, &keys("data.repo.items")).unwrap_err();
        assert!(err.to_string().contains("endCursor"));

        let err = read_cursor_page(&page, &keys("data.repository.items")).unwrap_err();
        assert!(err.to_string().contains("data.repository"), "{err}");

        let no_info = json!({"data": {"repo": {"items": {"nodes": []}}}});
        let err = read_cursor_page(&no_info, &keys("data.repo.items")).unwrap_err();
        assert!(err.to_string().contains("pageInfo"));

        let no_nodes = json!({"data": {"repo": {"items": {"pageInfo": {"hasNextPage": false}}}}});
        let err = read_cursor_page(&no_nodes, &keys("data.repo.items")).unwrap_err();
        assert!(err.to_string().contains("nodes"));
    }

    #[test]
    fn test_merge_replaces_nodes_and_strips_page_info() {
        let first = repo_page(json!(["A", "B"]), true, json!("c1"));
        let merged = merge_cursor_pages(
            first,
            &keys("data.repo.items"),
            vec![json!("A"), json!("B"), json!("C")],
        )
        .unwrap();

        assert_eq!(
            merged,
            json!({
                "data": {"repo": {
                    "name": "octo",
                    "items": {"totalCount": 3, "nodes": ["A", "B", "C"]}
                }}
            })
        );
    }

    #[test]
    fn test_next_link_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_link(&headers).unwrap(), None);

        headers.insert(
            "link".to_string(),
            r#"<https://api.github.com/user/repos?page=2>; rel="next", <https://api.github.com/user/repos?page=9>; rel="last""#
                .to_string(),
        );
        assert_eq!(
            next_link(&headers).unwrap().as_deref(),
            Some("https://api.github.com/user/repos?page=2")
        );

        headers.insert(
            "link".to_string(),
            r#"<https://api.github.com/user/repos?page=1>; rel="first""#.to_string(),
        );
        assert_eq!(next_link(&headers).unwrap(), None);

        headers.insert("link".to_string(), "page=2; next".to_string());
        assert!(matches!(next_link(&headers), Err(QueryError::UnexpectedShape { .. })));
    }

    #[test]
    fn test_array_items_rejects_objects() {
        assert_eq!(array_items(json!([1, 2])).unwrap(), vec![json!(1), json!(2)]);
        let err = array_items(json!({"items": []})).unwrap_err();
        assert!(err.to_string().contains("an object"));
    }

    #[test]
    fn test_graphql_data_extraction() {
        assert_eq!(
            graphql_data(json!({"data": {"viewer": {"login": "octocat"}}})).unwrap(),
            json!({"viewer": {"login": "octocat"}})
        );
        assert!(matches!(
            graphql_data(json!({"message": "hi"})),
            Err(QueryError::UnexpectedShape { .. })
        ));
        assert!(graphql_data(json!([1])).is_err());
    }
}
