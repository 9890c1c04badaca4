use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{ExportError, ExportResult};
use crate::validation::{require_non_empty, validate_positive, Validate};

pub const DEFAULT_PAGE_SIZE: i64 = 200;
pub const DEFAULT_POOL_MIN: u32 = 10;
pub const DEFAULT_POOL_MAX: u32 = 30;
pub const DEFAULT_POOL_IDLE_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_SINK_CAPACITY: usize = 1000;
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_SITE_BASE_URL: &str = "https://inkverse.co";

/// Sizing of the shared connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_POOL_MIN,
            max_connections: DEFAULT_POOL_MAX,
            idle_timeout_ms: DEFAULT_POOL_IDLE_TIMEOUT_MS,
        }
    }
}

impl Validate for PoolSettings {
    fn validate(&self) -> ExportResult<()> {
        if self.max_connections == 0 {
            return Err(ExportError::config("pool max connections must be positive"));
        }
        if self.min_connections > self.max_connections {
            return Err(ExportError::config(format!(
                "pool min connections ({}) exceeds max connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Settings of an export run, read from the environment and `.env`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSettings {
    #[serde(serialize_with = "redacted")]
    pub database_url: String,
    pub page_size: i64,
    pub pool: PoolSettings,
    pub sink_capacity: usize,
    pub output_dir: PathBuf,
    pub site_base_url: String,
}

impl ExportSettings {
    /// Load `.env` when present, then read the process environment.
    pub fn from_env() -> ExportResult<Self> {
        if dotenv::dotenv().is_err() {
            log::debug!("No .env file loaded");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup and validate them.
    pub fn from_lookup<F>(lookup: F) -> ExportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| ExportError::config("DATABASE_URL is not set"))?;

        let settings = Self {
            database_url,
            page_size: parse_var(&lookup, "EXPORT_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            pool: PoolSettings {
                min_connections: parse_var(&lookup, "EXPORT_POOL_MIN", DEFAULT_POOL_MIN)?,
                max_connections: parse_var(&lookup, "EXPORT_POOL_MAX", DEFAULT_POOL_MAX)?,
                idle_timeout_ms: parse_var(
                    &lookup,
                    "EXPORT_POOL_IDLE_TIMEOUT_MS",
                    DEFAULT_POOL_IDLE_TIMEOUT_MS,
                )?,
            },
            sink_capacity: parse_var(&lookup, "EXPORT_SINK_CAPACITY", DEFAULT_SINK_CAPACITY)?,
            output_dir: lookup("EXPORT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            site_base_url: lookup("EXPORT_SITE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SITE_BASE_URL.to_string()),
        };

        settings.validate()?;
        Ok(settings)
    }
}

impl Validate for ExportSettings {
    fn validate(&self) -> ExportResult<()> {
        require_non_empty("DATABASE_URL", &self.database_url)?;
        require_non_empty("EXPORT_SITE_BASE_URL", &self.site_base_url)?;
        require_non_empty("EXPORT_OUTPUT_DIR", &self.output_dir.to_string_lossy())?;
        validate_positive("EXPORT_PAGE_SIZE", self.page_size)?;
        if self.sink_capacity == 0 {
            return Err(ExportError::config("EXPORT_SINK_CAPACITY must be positive"));
        }
        self.pool.validate()
    }
}

impl fmt::Debug for ExportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportSettings")
            .field("database_url", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("pool", &self.pool)
            .field("sink_capacity", &self.sink_capacity)
            .field("output_dir", &self.output_dir)
            .field("site_base_url", &self.site_base_url)
            .finish()
    }
}

fn redacted<T, S: Serializer>(_: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("<redacted>")
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> ExportResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| {
            ExportError::config(format!("{} has invalid value '{}': {}", name, raw, e))
        }),
        _ => Ok(default),
    }
}
