use core_config::{ConfigError, FromEnv, env_duration_secs, env_or_default, server::ServerConfig};
use database::RetryConfig;
use database::postgres::PostgresConfig;
use domain_notifications::{DispatchConfig, EmailConfig};
use std::time::Duration;
use strum::{Display, EnumString};

pub use core_config::Environment;

/// Where notifications, events and child records live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StorageBackend {
    Postgres,
    /// Process-local stores, for local runs and demos.
    Memory,
}

/// Application configuration, composed from the shared config components.
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub storage: StorageBackend,
    /// Present when `storage` is `Postgres`.
    pub database: Option<PostgresConfig>,
    pub database_retry: RetryConfig,
    pub email: EmailConfig,
    pub dispatch: DispatchConfig,
    pub cors_origins: Vec<String>,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let environment = Environment::from_env();
        let server = ServerConfig::from_env()?;

        let raw_storage = env_or_default("STORAGE_BACKEND", "postgres");
        let storage: StorageBackend = raw_storage.parse().map_err(|_| ConfigError::ParseError {
            key: "STORAGE_BACKEND".to_string(),
            details: format!("expected 'postgres' or 'memory', got '{}'", raw_storage),
        })?;

        let database = match storage {
            StorageBackend::Postgres => Some(PostgresConfig::from_env()?),
            StorageBackend::Memory => None,
        };

        let cors_origins = env_or_default("CORS_ALLOWED_ORIGIN", "")
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            environment,
            server,
            storage,
            database,
            database_retry: RetryConfig::from_env()?,
            email: EmailConfig::from_env()?,
            dispatch: DispatchConfig::from_env()?,
            cors_origins,
            shutdown_timeout: env_duration_secs("SHUTDOWN_TIMEOUT_SECS", 30)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_needs_no_database() {
        temp_env::with_vars(
            [
                ("STORAGE_BACKEND", Some("memory")),
                ("DATABASE_URL", None),
                ("CORS_ALLOWED_ORIGIN", Some("http://localhost:3000, https://carebridge.app")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.storage, StorageBackend::Memory);
                assert!(config.database.is_none());
                assert_eq!(
                    config.cors_origins,
                    vec!["http://localhost:3000", "https://carebridge.app"]
                );
            },
        );
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        temp_env::with_vars(
            [("STORAGE_BACKEND", None::<&str>), ("DATABASE_URL", None)],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(err.to_string().contains("DATABASE_URL"));
            },
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        temp_env::with_var("STORAGE_BACKEND", Some("sqlite"), || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("STORAGE_BACKEND"));
        });
    }
}
