//! Engine configuration: built-in defaults, an optional config file, and CLI overrides.
//!
//! The config file uses a flat `key = value` subset of TOML:
//!
//! ```text
//! # ~/.config/querier/config.toml
//! graphql_url = "https://ghe.example.com/api/graphql"
//! rest_url = "https://ghe.example.com/api/v3"
//! max_retries = 5
//! retry_delay_secs = 3
//! read_timeout_secs = 120
//! verbosity = "verbose"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::query::{
    CONNECT_TIMEOUT_SECS, DEFAULT_GRAPHQL_URL, DEFAULT_MAX_ATTEMPTS, DEFAULT_REST_BASE_URL,
    DEFAULT_RETRY_DELAY, READ_TIMEOUT_SECS, RetryPolicy, TransportSettings,
};

/// Accepted range for `max_retries`.
pub const MAX_RETRIES_RANGE: std::ops::RangeInclusive<u32> = 1..=100;

/// Accepted range for timeouts, in seconds.
pub const TIMEOUT_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=3600;

/// Upper bound for `retry_delay_secs`.
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;

/// Values read from the config file; `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// GraphQL endpoint URL.
    pub graphql_url: Option<String>,
    /// REST base URL.
    pub rest_url: Option<String>,
    /// Attempts per logical request (1..=100).
    pub max_retries: Option<u32>,
    /// Fixed delay between attempts, in seconds.
    pub retry_delay_secs: Option<u64>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Default verbosity mode.
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first field outside its accepted range.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_retries) = self.max_retries
            && !MAX_RETRIES_RANGE.contains(&max_retries)
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 1..=100");
        }

        if let Some(delay) = self.retry_delay_secs
            && delay > MAX_RETRY_DELAY_SECS
        {
            bail!("Invalid config value for `retry_delay_secs`: {delay}. Expected range: 0..=3600");
        }

        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_url("graphql_url", self.graphql_url.as_deref())?;
        validate_url("rest_url", self.rest_url.as_deref())?;

        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !TIMEOUT_SECS_RANGE.contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

fn validate_url(field: &str, value: Option<&str>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let parsed = url::Url::parse(value)
        .with_context(|| format!("Invalid config value for `{field}`: '{value}' is not a URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Invalid config value for `{field}`: '{value}'. Expected an http(s) URL");
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Returns the stable string label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }

    /// Default tracing filter directive for this mode.
    #[must_use]
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Effective engine settings after defaults, file, and CLI are layered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Endpoints and timeouts for the HTTP transport.
    pub transport: TransportSettings,
    /// Attempts per logical request.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings {
                graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
                rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
                connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
                read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            },
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl EngineConfig {
    /// Overlays every value set in `file`.
    #[must_use]
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(url) = &file.graphql_url {
            self.transport.graphql_url.clone_from(url);
        }
        if let Some(url) = &file.rest_url {
            self.transport.rest_base_url.clone_from(url);
        }
        if let Some(max_retries) = file.max_retries {
            self.max_attempts = max_retries;
        }
        if let Some(secs) = file.retry_delay_secs {
            self.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.transport.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.read_timeout_secs {
            self.transport.read_timeout = Duration::from_secs(secs);
        }
        self
    }

    /// Retry policy for these settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_delay)
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
    /// Indicates whether configuration was loaded from disk.
    pub loaded_from_file: bool,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/querier/config.toml`
/// 2. `$HOME/.config/querier/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("querier")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("querier")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from default path if present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or validated.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let Some(path_ref) = path.as_deref() else {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    };

    if !path_ref.exists() {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    }

    let config = load_file_config(path_ref)?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
        loaded_from_file: true,
    })
}

/// Reads and validates the config file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();

        match key {
            "graphql_url" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `graphql_url` value on line {line_no}"))?;
                cfg.graphql_url = Some(parsed);
            }
            "rest_url" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `rest_url` value on line {line_no}"))?;
                cfg.rest_url = Some(parsed);
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `max_retries` value on line {line_no}"))?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_retries out of range for u32"))?;
                cfg.max_retries = Some(n);
            }
            "retry_delay_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `retry_delay_secs` value on line {line_no}")
                })?;
                cfg.retry_delay_secs = Some(parsed);
            }
            "connect_timeout_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `connect_timeout_secs` value on line {line_no}")
                })?;
                cfg.connect_timeout_secs = Some(parsed);
            }
            "read_timeout_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `read_timeout_secs` value on line {line_no}")
                })?;
                cfg.read_timeout_secs = Some(parsed);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `verbosity` value on line {line_no}"))?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}
