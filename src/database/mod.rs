use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;

use crate::config::PoolSettings;
use crate::errors::{ExportError, ExportResult};
use crate::validation::Validate;

/// Backend named by the scheme of a database URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgres,
    Sqlite,
}

impl DatabaseKind {
    pub fn from_url(database_url: &str) -> ExportResult<Self> {
        let scheme = database_url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();

        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ExportError::config(
                "DATABASE_URL must start with postgres://, postgresql:// or sqlite:",
            )),
        }
    }
}

/// Connect the shared Postgres pool every page of a job borrows from.
pub async fn connect_pg_pool(database_url: &str, settings: &PoolSettings) -> ExportResult<PgPool> {
    settings.validate()?;

    log::info!(
        "Connecting Postgres pool (min {}, max {}, idle timeout {}ms)",
        settings.min_connections,
        settings.max_connections,
        settings.idle_timeout_ms
    );

    let pool = PgPoolOptions::new()
        .min_connections(settings.min_connections)
        .max_connections(settings.max_connections)
        .idle_timeout(Duration::from_millis(settings.idle_timeout_ms))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Connect a SQLite database. Used when `DATABASE_URL` has the `sqlite:` scheme.
pub async fn connect_sqlite_pool(database_url: &str, settings: &PoolSettings) -> ExportResult<SqlitePool> {
    settings.validate()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .idle_timeout(Duration::from_millis(settings.idle_timeout_ms))
        .connect(database_url)
        .await?;

    log::debug!("Connected SQLite pool at {}", database_url);
    Ok(pool)
}
