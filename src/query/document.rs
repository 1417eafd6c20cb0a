//! Query document loading and normalization.
//!
//! GraphQL documents are written "pretty" (multi-line, with `#` comments) but
//! sent as a single line. [`QueryDocumentCache`] reads a document, strips the
//! comments, condenses whitespace, and remembers the last result so repeated
//! pagination runs over the same file skip the re-read.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use querier_core::query::QueryDocumentCache;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cache = QueryDocumentCache::new();
//! let query = cache.resolve(Path::new("queries/org_repos.gql"))?;
//! println!("{query}");
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, instrument};

use super::error::DocumentError;

/// Where query documents come from.
///
/// The filesystem implementation is [`FsDocumentSource`]; tests substitute
/// counting stubs.
pub trait DocumentSource {
    /// Canonical identity of `location`, used as the cache key.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotFound`] when the location does not exist.
    fn locate(&self, location: &Path) -> Result<PathBuf, DocumentError>;

    /// Last modification time of the document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError`] when the metadata cannot be read.
    fn modified(&self, location: &Path) -> Result<SystemTime, DocumentError>;

    /// Full document contents.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError`] when the document cannot be read.
    fn read(&self, location: &Path) -> Result<String, DocumentError>;
}

/// Reads documents from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDocumentSource;

impl DocumentSource for FsDocumentSource {
    fn locate(&self, location: &Path) -> Result<PathBuf, DocumentError> {
        if !location.is_file() {
            return Err(DocumentError::not_found(location));
        }
        std::fs::canonicalize(location).map_err(|e| DocumentError::io(location, e))
    }

    fn modified(&self, location: &Path) -> Result<SystemTime, DocumentError> {
        std::fs::metadata(location)
            .and_then(|meta| meta.modified())
            .map_err(|e| DocumentError::io(location, e))
    }

    fn read(&self, location: &Path) -> Result<String, DocumentError> {
        std::fs::read_to_string(location).map_err(|e| DocumentError::io(location, e))
    }
}

#[derive(Debug, Clone)]
struct CachedDocument {
    location: PathBuf,
    modified: SystemTime,
    text: String,
}

/// Memoizes the most recently resolved query document.
///
/// A cached entry is reused only when both the canonical location and the
/// modification time match the previous call.
#[derive(Debug)]
pub struct QueryDocumentCache<S = FsDocumentSource> {
    source: S,
    cached: Option<CachedDocument>,
}

impl Default for QueryDocumentCache<FsDocumentSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryDocumentCache<FsDocumentSource> {
    /// Creates an empty cache backed by the filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(FsDocumentSource)
    }
}

impl<S: DocumentSource> QueryDocumentCache<S> {
    /// Creates an empty cache backed by a custom source.
    #[must_use]
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            cached: None,
        }
    }

    /// Returns the underlying source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolves `location` to a normalized single-line query.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotFound`] if the location does not exist, or
    /// [`DocumentError::Io`] if it cannot be read.
    #[instrument(skip_all, fields(location = %location.display()))]
    pub fn resolve(&mut self, location: &Path) -> Result<String, DocumentError> {
        let canonical = self.source.locate(location)?;
        let modified = self.source.modified(&canonical)?;

        if let Some(cached) = &self.cached
            && cached.location == canonical
            && cached.modified == modified
        {
            debug!("using cached query document");
            return Ok(cached.text.clone());
        }

        debug!("reading query document");
        let raw = self.source.read(&canonical)?;
        let text = normalize_query(&raw);
        self.cached = Some(CachedDocument {
            location: canonical,
            modified,
            text: text.clone(),
        });
        Ok(text)
    }
}

/// Strips `#` comments, condenses whitespace runs to single spaces, and trims.
///
/// ```
/// use querier_core::query::normalize_query;
///
/// let text = "query {\n  # who am I\n  viewer { login }\n}\n";
/// assert_eq!(normalize_query(text), "query { viewer { login } }");
/// ```
#[must_use]
pub fn normalize_query(text: &str) -> String {
    let mut condensed = String::with_capacity(text.len());
    for line in text.lines() {
        let code = line.split_once('#').map_or(line, |(before, _)| before);
        for word in code.split_whitespace() {
            if !condensed.is_empty() {
                condensed.push(' ');
            }
            condensed.push_str(word);
        }
    }
    condensed
}
