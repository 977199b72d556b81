//! The `smtpflow.config.ron` file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use smtpflow_delivery::RelayConfig;
use smtpflow_http::HttpConfig;
use smtpflow_smtp::SmtpServerConfig;
use smtpflow_store::{Tenant, quota::DEFAULT_MONTHLY_LIMIT};
use thiserror::Error;

pub const CONFIG_ENV: &str = "SMTPFLOW_CONFIG";
pub const RELAY_USER_ENV: &str = "SMTPFLOW_RELAY_USER";
pub const RELAY_PASS_ENV: &str = "SMTPFLOW_RELAY_PASS";
pub const BOUNCE_SECRET_ENV: &str = "SMTPFLOW_BOUNCE_SECRET";

const DEFAULT_PATHS: [&str; 2] = [
    "./smtpflow.config.ron",
    "/etc/smtpflow/smtpflow.config.ron",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{source_name} points to non-existent file: {}", .path.display())]
    MissingFile { source_name: &'static str, path: PathBuf },

    #[error("No configuration file found. Tried:\n{tried}")]
    NotFound { tried: String },

    #[error("Failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Where tenants, quota counters and delivery events live.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    /// Process local, seeded with `tenants`. Nothing survives a restart.
    Memory {
        #[serde(default)]
        tenants: Vec<Tenant>,
    },
    /// Durable. `tenants` are upserted at startup, leaving any other rows
    /// in the database alone.
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_pool_size")]
        pool_size: u32,
        #[serde(default)]
        tenants: Vec<Tenant>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            tenants: Vec::new(),
        }
    }
}

const fn default_pool_size() -> u32 {
    8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuotaConfig {
    /// Applied to tenants whose plan has no monthly limit.
    #[serde(default = "default_monthly_limit")]
    pub default_monthly_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_monthly_limit: default_monthly_limit(),
        }
    }
}

const fn default_monthly_limit() -> u64 {
    DEFAULT_MONTHLY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub relay: RelayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl Config {
    /// Parse a configuration document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    /// Read and parse `path`, then apply the environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Secrets that are better kept out of the file.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value: &String| !value.is_empty());

        if let Some(user) = lookup(RELAY_USER_ENV) {
            self.relay.username = Some(user);
        }
        if let Some(pass) = lookup(RELAY_PASS_ENV) {
            self.relay.password = Some(pass);
        }
        if let Some(secret) = lookup(BOUNCE_SECRET_ENV) {
            self.http.bounce_secret = Some(secret);
        }
    }
}

/// Find the configuration file using the following precedence:
/// 1. `--config` on the command line
/// 2. `SMTPFLOW_CONFIG` environment variable
/// 3. ./smtpflow.config.ron (current working directory)
/// 4. /etc/smtpflow/smtpflow.config.ron (system-wide config)
pub fn find_config_file(
    cli: Option<PathBuf>,
    env: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    for (source_name, path) in [("--config", cli), (CONFIG_ENV, env)] {
        if let Some(path) = path {
            return if path.exists() {
                Ok(path)
            } else {
                Err(ConfigError::MissingFile { source_name, path })
            };
        }
    }

    DEFAULT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| ConfigError::NotFound {
            tried: std::iter::once(format!("  - --config / {CONFIG_ENV}"))
                .chain(DEFAULT_PATHS.iter().map(|path| format!("  - {path}")))
                .collect::<Vec<_>>()
                .join("\n"),
        })
}
