//! Request descriptions submitted to the engine.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

/// Which API flavor a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// A query document plus variables, POSTed to the GraphQL endpoint.
    GraphQl,
    /// A GET against a REST path or absolute URL.
    Rest,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GraphQl => f.write_str("GraphQL"),
            Self::Rest => f.write_str("REST"),
        }
    }
}

/// One query as submitted by a caller.
///
/// For [`QueryMode::GraphQl`] `text` is the query document. For
/// [`QueryMode::Rest`] it is a path appended to the REST base URL, or an
/// absolute `http(s)://` URL which is requested verbatim (next-page links
/// arrive this way).
///
/// The engine works on its own clone; only the pagination driver changes
/// variables (the cursor) between pages.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    mode: QueryMode,
    text: String,
    variables: Map<String, Value>,
    headers: BTreeMap<String, String>,
}

impl QueryRequest {
    /// Creates a GraphQL request with no variables.
    #[must_use]
    pub fn graphql(query: impl Into<String>) -> Self {
        Self::new(QueryMode::GraphQl, query)
    }

    /// Creates a REST request for a path or absolute URL.
    #[must_use]
    pub fn rest(path: impl Into<String>) -> Self {
        Self::new(QueryMode::Rest, path)
    }

    fn new(mode: QueryMode, text: impl Into<String>) -> Self {
        Self {
            mode,
            text: text.into(),
            variables: Map::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Replaces all variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Sets a single variable, keeping insertion order for new keys.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Adds an extra request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns the request mode.
    #[must_use]
    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Returns the query document (GraphQL) or path/URL (REST).
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the GraphQL variables.
    #[must_use]
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Returns the extra headers.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Whether a REST target is an absolute URL rather than a path.
    #[must_use]
    pub fn is_absolute_target(&self) -> bool {
        self.mode == QueryMode::Rest
            && (self.text.starts_with("https://") || self.text.starts_with("http://"))
    }

    /// Points the request at a new target (next-page link), keeping headers.
    pub(crate) fn set_target(&mut self, target: impl Into<String>) {
        self.text = target.into();
    }

    /// Sets the pagination cursor variable.
    pub(crate) fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }
}
