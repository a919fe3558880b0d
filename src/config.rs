//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Job store configuration, passed explicitly to the backend, the service
/// and the sweeper.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    pub database_path: PathBuf,
    /// Maximum number of live database connections.
    pub pool_size: usize,
    /// Upper bound on any single operation, including waiting for a lock.
    pub operation_timeout: Duration,
    /// Lifetime given to jobs created without a destruction time.
    /// `None` means such jobs never expire.
    pub default_lifetime: Option<chrono::Duration>,
    /// Time between sweeps in `serve`.
    pub sweep_interval: Duration,
    /// Expired jobs fetched per sweep batch.
    pub sweep_batch_size: usize,
    /// Largest page `list` will return.
    pub max_page_size: usize,
    /// Re-open HELD and SUSPENDED jobs for parameter changes.
    pub allow_reparameterization: bool,
    /// Users granted the administrative override.
    pub admin_users: Vec<String>,
    /// Listen address of the HTTP adapter.
    pub bind_address: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/uws.db"),
            pool_size: 4,
            operation_timeout: Duration::from_millis(5000),
            default_lifetime: Some(chrono::Duration::days(30)),
            sweep_interval: Duration::from_secs(300), // 5 minutes
            sweep_batch_size: 100,
            max_page_size: 1000,
            allow_reparameterization: false,
            admin_users: Vec::new(),
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl StoreConfig {
    /// Build from `UWS_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let lifetime_secs: u64 = parse_or(
            "UWS_DEFAULT_LIFETIME_SECS",
            var("UWS_DEFAULT_LIFETIME_SECS"),
            defaults
                .default_lifetime
                .map(|d| d.num_seconds().max(0) as u64)
                .unwrap_or(0),
        )?;
        let default_lifetime = if lifetime_secs == 0 {
            None
        } else {
            let secs = i64::try_from(lifetime_secs).map_err(|_| invalid(
                "UWS_DEFAULT_LIFETIME_SECS",
                "value is too large",
            ))?;
            Some(
                chrono::Duration::try_seconds(secs)
                    .ok_or_else(|| invalid("UWS_DEFAULT_LIFETIME_SECS", "value is too large"))?,
            )
        };

        let config = Self {
            database_path: var("UWS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            pool_size: parse_or("UWS_POOL_SIZE", var("UWS_POOL_SIZE"), defaults.pool_size)?,
            operation_timeout: Duration::from_millis(parse_or(
                "UWS_OPERATION_TIMEOUT_MS",
                var("UWS_OPERATION_TIMEOUT_MS"),
                defaults.operation_timeout.as_millis() as u64,
            )?),
            default_lifetime,
            sweep_interval: Duration::from_secs(parse_or(
                "UWS_SWEEP_INTERVAL_SECS",
                var("UWS_SWEEP_INTERVAL_SECS"),
                defaults.sweep_interval.as_secs(),
            )?),
            sweep_batch_size: parse_or(
                "UWS_SWEEP_BATCH_SIZE",
                var("UWS_SWEEP_BATCH_SIZE"),
                defaults.sweep_batch_size,
            )?,
            max_page_size: parse_or(
                "UWS_MAX_PAGE_SIZE",
                var("UWS_MAX_PAGE_SIZE"),
                defaults.max_page_size,
            )?,
            allow_reparameterization: match var("UWS_ALLOW_REPARAMETERIZATION") {
                Some(raw) => parse_bool("UWS_ALLOW_REPARAMETERIZATION", &raw)?,
                None => defaults.allow_reparameterization,
            },
            admin_users: var("UWS_ADMIN_USERS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            bind_address: var("UWS_BIND_ADDRESS").unwrap_or(defaults.bind_address),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("UWS_POOL_SIZE", "must be at least 1"));
        }
        if self.sweep_batch_size == 0 {
            return Err(invalid("UWS_SWEEP_BATCH_SIZE", "must be at least 1"));
        }
        if self.max_page_size == 0 {
            return Err(invalid("UWS_MAX_PAGE_SIZE", "must be at least 1"));
        }
        if self.operation_timeout.is_zero() {
            return Err(invalid("UWS_OPERATION_TIMEOUT_MS", "must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("UWS_SWEEP_INTERVAL_SECS", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("{raw:?} is not a boolean"))),
    }
}
