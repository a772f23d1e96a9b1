//! Database setup: connects to an external PostgreSQL instance, or — with
//! the `embedded-db` feature — starts a bundled one for single-binary
//! deployments.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{Config, DatabaseConfig};

#[cfg(feature = "embedded-db")]
pub struct EmbeddedDatabase {
    postgres: postgresql_embedded::PostgreSQL,
    connection_string: String,
}

#[cfg(feature = "embedded-db")]
impl EmbeddedDatabase {
    /// Starts a new embedded PostgreSQL instance on an OS-assigned ephemeral
    /// port and creates the `gateway` database.
    async fn start(data_dir: Option<std::path::PathBuf>, persistent: bool) -> anyhow::Result<Self> {
        use postgresql_embedded::{PostgreSQL, Settings, V16};

        let data_dir = data_dir.unwrap_or_else(|| {
            std::env::home_dir().map(|h| h.join(".gateway_data").join("postgres")).unwrap_or_else(|| "gateway_data/postgres".into())
        });

        tracing::debug!(persistent, data_dir = %data_dir.display(), "starting embedded PostgreSQL");

        let settings = Settings {
            version: V16.clone(),
            port: 0,
            username: "postgres".to_string(),
            password: "password".to_string(),
            temporary: !persistent,
            installation_dir: data_dir.join("installation"),
            data_dir: data_dir.join("data"),
            ..Default::default()
        };

        let mut postgres = PostgreSQL::new(settings);
        postgres.setup().await.map_err(|e| anyhow::anyhow!("failed to set up embedded PostgreSQL: {e}"))?;
        postgres.start().await.map_err(|e| anyhow::anyhow!("failed to start embedded PostgreSQL: {e}"))?;

        let database_name = "gateway";
        postgres.create_database(database_name).await.map_err(|e| anyhow::anyhow!("failed to create database '{database_name}': {e}"))?;
        let connection_string = postgres.settings().url(database_name);

        tracing::info!(port = postgres.settings().port, "embedded PostgreSQL started");
        Ok(Self { postgres, connection_string })
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.postgres.stop().await.map_err(|e| anyhow::anyhow!("failed to stop embedded PostgreSQL: {e}"))
    }
}

/// Connects to the database described by `config`, starting an embedded
/// instance first if so configured. Returns the pool and, when embedded,
/// a handle whose lifetime must outlive the pool (dropping it stops the
/// server).
pub async fn connect(config: &Config) -> anyhow::Result<(PgPool, Option<EmbeddedDatabaseHandle>)> {
    match &config.database {
        DatabaseConfig::External { url } => {
            let pool = PgPoolOptions::new().max_connections(20).connect(url).await?;
            Ok((pool, None))
        }
        #[cfg(feature = "embedded-db")]
        DatabaseConfig::Embedded { .. } => {
            let embedded = EmbeddedDatabase::start(config.embedded_data_dir(), config.embedded_persistent()).await?;
            let pool = PgPoolOptions::new().max_connections(20).connect(&embedded.connection_string).await?;
            Ok((pool, Some(embedded)))
        }
    }
}

#[cfg(feature = "embedded-db")]
pub type EmbeddedDatabaseHandle = EmbeddedDatabase;
#[cfg(not(feature = "embedded-db"))]
pub type EmbeddedDatabaseHandle = std::convert::Infallible;
