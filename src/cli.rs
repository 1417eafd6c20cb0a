//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Run a query against a rate-limited, paginated API and print the JSON result.
///
/// Querier retries transient failures, waits out rate-limit resets, and
/// follows pagination until the result is complete.
#[derive(Parser, Debug)]
#[command(name = "querier")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// API token (defaults to the GITHUB_API_TOKEN environment variable)
    #[arg(long, env = "GITHUB_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Maximum attempts per request for transient failures (1-100)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: Option<u32>,

    /// Seconds to wait between attempts (0-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(0..=3600))]
    pub retry_delay: Option<u64>,

    /// GraphQL endpoint URL
    #[arg(long)]
    pub graphql_url: Option<String>,

    /// Base URL for REST paths
    #[arg(long)]
    pub rest_url: Option<String>,

    /// HTTP connect timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// HTTP read timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub read_timeout: Option<u64>,

    /// Treat QUERY as a REST path or URL instead of a GraphQL document
    #[arg(long)]
    pub rest: bool,

    /// Read the GraphQL document from a file
    #[arg(short, long, conflicts_with_all = ["query", "rest"])]
    pub file: Option<PathBuf>,

    /// GraphQL variables as a JSON object
    #[arg(long, value_name = "JSON", conflicts_with = "rest")]
    pub vars: Option<String>,

    /// Follow pagination (Link headers for REST, cursors for GraphQL)
    #[arg(short, long)]
    pub paginate: bool,

    /// GraphQL variable that receives the page cursor
    #[arg(long, default_value = "cursor")]
    pub cursor_var: String,

    /// Dot-separated path to the paginated connection, e.g. data.organization.repositories
    #[arg(long, value_name = "PATH")]
    pub keys: Option<String>,

    /// Only check that the token is accepted
    #[arg(long, conflicts_with_all = ["query", "file", "paginate"])]
    pub verify_token: bool,

    /// GraphQL document, or REST path/URL with --rest
    pub query: Option<String>,
}

impl Args {
    /// Splits `--keys` into path segments.
    #[must_use]
    pub fn key_path(&self) -> Vec<String> {
        self.keys
            .as_deref()
            .map(|keys| keys.split('.').map(str::to_string).collect())
            .unwrap_or_default()
    }
}
