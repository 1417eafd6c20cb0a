//! Querier Core Library
//!
//! This library runs queries against a rate-limited, paginated API
//! (GitHub-style GraphQL and REST endpoints) and drives each query to a
//! complete, fully-paginated result.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`query`] - Transport, response classification, rate-limit and retry
//!   handling, and the pagination engine
//! - [`config`] - Engine defaults and the optional config file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod query;
mod user_agent;

// Re-export commonly used types
pub use config::{EngineConfig, FileConfig};
pub use query::{
    HttpTransport, Pagination, QueryDocumentCache, QueryEngine, QueryError, QueryMode,
    QueryRequest, RateLimitGuard, RetryPolicy, TransportSettings,
};
