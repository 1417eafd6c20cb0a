//! CLI entry point for the querier tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use querier_core::config::{EngineConfig, load_default_file_config};
use querier_core::query::{
    HttpTransport, Pagination, QueryDocumentCache, QueryEngine, QueryRequest, normalize_query,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let loaded = load_default_file_config()?;
    let file_config = loaded.config.clone().unwrap_or_default();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config file > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => file_config
                .verbosity
                .map_or("info", |verbosity| verbosity.filter_directive()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries only the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(
        rest = args.rest,
        paginate = args.paginate,
        file = ?args.file,
        has_token = args.token.is_some(),
        "CLI arguments parsed"
    );
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "loaded config file");
    }

    let config = apply_cli_overrides(EngineConfig::default().with_file(&file_config), &args);
    let Some(token) = args.token.clone().filter(|token| !token.trim().is_empty()) else {
        bail!("No API token: pass --token or set GITHUB_API_TOKEN");
    };

    let transport = Arc::new(HttpTransport::new(token, &config.transport)?);
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_interrupt_listener(Arc::clone(&interrupted));

    let engine =
        QueryEngine::new(transport, config.retry_policy()).with_interrupt_flag(interrupted);

    if args.verify_token {
        engine.verify_credential().await?;
        info!("API token is valid");
        return Ok(());
    }

    let variables = parse_variables(args.vars.as_deref())?;
    let pagination = pagination_for(&args);

    let result = if let Some(path) = &args.file {
        let mut cache = QueryDocumentCache::new();
        engine
            .query_from_file(&mut cache, path, variables, &pagination)
            .await?
    } else {
        let Some(text) = args.query.as_deref() else {
            bail!("No query given: pass QUERY or --file (see --help)");
        };
        let request = if args.rest {
            QueryRequest::rest(text.trim())
        } else {
            QueryRequest::graphql(normalize_query(text)).with_variables(variables)
        };
        engine.paginate_all(&request, &pagination).await?
    };

    let rendered = serde_json::to_string_pretty(&result).context("Failed to render result")?;
    println!("{rendered}");
    Ok(())
}

fn apply_cli_overrides(mut config: EngineConfig, args: &Args) -> EngineConfig {
    if let Some(url) = &args.graphql_url {
        config.transport.graphql_url.clone_from(url);
    }
    if let Some(url) = &args.rest_url {
        config.transport.rest_base_url.clone_from(url);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_attempts = max_retries;
    }
    if let Some(secs) = args.retry_delay {
        config.retry_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = args.connect_timeout {
        config.transport.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.read_timeout {
        config.transport.read_timeout = Duration::from_secs(secs);
    }
    config
}

fn parse_variables(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--vars is not valid JSON")? {
        Value::Object(variables) => Ok(variables),
        _ => bail!("--vars must be a JSON object"),
    }
}

fn pagination_for(args: &Args) -> Pagination {
    if !args.paginate {
        Pagination::None
    } else if args.rest {
        Pagination::Links
    } else {
        Pagination::cursor(args.cursor_var.clone(), args.key_path())
    }
}

fn spawn_interrupt_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current request");
            flag.store(true, Ordering::SeqCst);
        }
    });
}
