//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `GATEWAY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `GATEWAY_` override YAML values
//! 3. **DATABASE_URL** - Special case: overrides `database.url` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `GATEWAY_ENGINE__MAX_QUEUE_SIZE=500` sets `engine.max_queue_size`.

use std::path::PathBuf;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use gateway_core::config::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// CLI arguments: just enough to locate the config file and support
/// `--validate` in CI.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "GATEWAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Either an external PostgreSQL connection string or, with the
/// `embedded-db` feature, a self-managed local instance for development.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseConfig {
    External {
        url: String,
    },
    #[cfg(feature = "embedded-db")]
    Embedded {
        data_dir: Option<PathBuf>,
        #[serde(default = "default_true")]
        persistent: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        #[cfg(feature = "embedded-db")]
        {
            DatabaseConfig::Embedded { data_dir: None, persistent: true }
        }
        #[cfg(not(feature = "embedded-db"))]
        {
            DatabaseConfig::External { url: "postgres://localhost/gateway".to_string() }
        }
    }
}

impl DatabaseConfig {
    pub fn external_url(&self) -> Option<&str> {
        match self {
            DatabaseConfig::External { url } => Some(url),
            #[cfg(feature = "embedded-db")]
            DatabaseConfig::Embedded { .. } => None,
        }
    }

    #[cfg(feature = "embedded-db")]
    pub fn is_embedded(&self) -> bool {
        matches!(self, DatabaseConfig::Embedded { .. })
    }

    #[cfg(not(feature = "embedded-db"))]
    pub fn is_embedded(&self) -> bool {
        false
    }
}

/// CORS origin list entry, allowing the literal wildcard alongside concrete
/// origins so `validate()` can refuse pairing it with multiple origins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigin {
    Wildcard,
    Url(String),
}

impl CorsOrigin {
    fn parse(raw: &str) -> Self {
        if raw == "*" { CorsOrigin::Wildcard } else { CorsOrigin::Url(raw.to_string()) }
    }
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Root application configuration, loaded from YAML + environment via
/// [`Config::load`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server host to bind to (e.g. "0.0.0.0" for all interfaces).
    pub host: String,
    /// HTTP server port to bind to.
    pub port: u16,
    /// Deprecated: use `database.url` instead. Kept so a bare
    /// `DATABASE_URL` environment variable still works.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    /// Request lifecycle engine tuning and provider registrations.
    pub engine: EngineConfig,
    /// Allowed CORS origins; `"*"` is the literal wildcard.
    pub cors_allowed_origins: Vec<String>,
    /// Enable OpenTelemetry OTLP export for distributed tracing.
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            cors_allowed_origins: default_cors_origins(),
            enable_otel_export: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database = DatabaseConfig::External { url };
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Cross-field validation the serde defaults can't express on their own.
    pub fn validate(&self) -> Result<(), Error> {
        if self.engine.max_queue_size == 0 {
            return Err(Error::BadRequest { message: "engine.max_queue_size must be greater than 0".to_string() });
        }
        if self.engine.max_concurrent_requests == 0 {
            return Err(Error::BadRequest { message: "engine.max_concurrent_requests must be greater than 0".to_string() });
        }
        if let Some(default_provider) = &self.engine.default_provider {
            if !self.engine.providers.contains_key(default_provider) {
                return Err(Error::BadRequest {
                    message: format!("engine.default_provider '{default_provider}' is not a configured provider"),
                });
            }
        }
        for (name, provider) in &self.engine.providers {
            if provider.timeout_s == 0 {
                return Err(Error::BadRequest { message: format!("provider '{name}': timeout_s must be greater than 0") });
            }
        }

        if self.cors_allowed_origins.is_empty() {
            return Err(Error::BadRequest { message: "cors_allowed_origins cannot be empty".to_string() });
        }
        let origins: Vec<CorsOrigin> = self.cors_allowed_origins.iter().map(|s| CorsOrigin::parse(s)).collect();
        if origins.iter().any(|o| *o == CorsOrigin::Wildcard) && origins.len() > 1 {
            return Err(Error::BadRequest {
                message: "cors_allowed_origins: the wildcard '*' must not be combined with explicit origins".to_string(),
            });
        }

        #[cfg(not(feature = "embedded-db"))]
        if self.database.external_url().is_none() {
            return Err(Error::BadRequest { message: "database.url is required when the embedded-db feature is disabled".to_string() });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cors_origins(&self) -> Vec<CorsOrigin> {
        self.cors_allowed_origins.iter().map(|s| CorsOrigin::parse(s)).collect()
    }

    #[cfg(feature = "embedded-db")]
    pub fn embedded_data_dir(&self) -> Option<PathBuf> {
        match &self.database {
            DatabaseConfig::Embedded { data_dir, .. } => data_dir.clone(),
            DatabaseConfig::External { .. } => None,
        }
    }

    #[cfg(feature = "embedded-db")]
    pub fn embedded_persistent(&self) -> bool {
        match &self.database {
            DatabaseConfig::Embedded { persistent, .. } => *persistent,
            DatabaseConfig::External { .. } => true,
        }
    }
}
