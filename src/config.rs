//! Pool and database configuration.
//!
//! Configuration is an explicit value handed to [`ConnectionPool`](crate::ConnectionPool);
//! nothing is read from ambient state unless [`DatabaseConfig::from_env`] is called.

use serde::Deserialize;
use std::time::Duration;

use crate::{UowError, UowResult};

const DEFAULT_SIZE: usize = 10;
const DEFAULT_MAX_OVERFLOW: usize = 5;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sizing and liveness options for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Number of connections kept idle once released.
    pub size: usize,
    /// Extra connections that may be opened under load, closed again on release.
    pub max_overflow: usize,
    /// Maximum time `acquire` waits for a free slot.
    #[serde(rename = "acquire_timeout_ms", with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Ping idle connections before handing them out.
    pub pre_ping: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            pre_ping: true,
        }
    }
}

impl PoolOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    pub fn max_overflow(mut self, n: usize) -> Self {
        self.max_overflow = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn pre_ping(mut self, enabled: bool) -> Self {
        self.pre_ping = enabled;
        self
    }

    /// Upper bound on simultaneously leased connections.
    pub fn capacity(&self) -> usize {
        self.size + self.max_overflow
    }

    pub fn validate(&self) -> UowResult<()> {
        if self.size == 0 {
            return Err(UowError::Config("pool size must be at least 1".into()));
        }
        if self.acquire_timeout.is_zero() {
            return Err(UowError::Config("acquire timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Connection string plus pool options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
    #[serde(default)]
    pub pool: PoolOptions,
}

impl DatabaseConfig {
    pub fn new(dsn: impl Into<String>, pool: PoolOptions) -> Self {
        Self {
            dsn: dsn.into(),
            pool,
        }
    }

    /// Reads `DATABASE_URL` and the optional `UOW_POOL_SIZE`, `UOW_MAX_OVERFLOW`,
    /// `UOW_ACQUIRE_TIMEOUT_MS` and `UOW_PRE_PING` variables.
    pub fn from_env() -> UowResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> UowResult<Self> {
        let dsn = lookup("DATABASE_URL")
            .ok_or_else(|| UowError::Config("DATABASE_URL is not set".into()))?;

        let mut pool = PoolOptions::default();
        if let Some(v) = lookup("UOW_POOL_SIZE") {
            pool.size = parse_var("UOW_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("UOW_MAX_OVERFLOW") {
            pool.max_overflow = parse_var("UOW_MAX_OVERFLOW", &v)?;
        }
        if let Some(v) = lookup("UOW_ACQUIRE_TIMEOUT_MS") {
            pool.acquire_timeout = Duration::from_millis(parse_var("UOW_ACQUIRE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("UOW_PRE_PING") {
            pool.pre_ping = parse_var("UOW_PRE_PING", &v)?;
        }
        pool.validate()?;

        Ok(Self { dsn, pool })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> UowResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| UowError::Config(format!("{key} has an invalid value: {value:?}")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_engine_setup() {
        let options = PoolOptions::default();
        assert_eq!(options.size, 10);
        assert_eq!(options.max_overflow, 5);
        assert_eq!(options.acquire_timeout, Duration::from_secs(5));
        assert!(options.pre_ping);
        assert_eq!(options.capacity(), 15);
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = PoolOptions::new(0).validate().unwrap_err();
        assert!(matches!(err, UowError::Config(_)));
    }

    #[test]
    fn deserializes_with_millisecond_timeout() {
        let config: DatabaseConfig = serde_json::from_str(
            r#"{"dsn": "postgres://localhost/app", "pool": {"size": 2, "acquire_timeout_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.size, 2);
        assert_eq!(config.pool.max_overflow, 5);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn reads_overrides_from_environment() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://db/app"),
            ("UOW_POOL_SIZE", "1"),
            ("UOW_MAX_OVERFLOW", "0"),
            ("UOW_ACQUIRE_TIMEOUT_MS", "1500"),
            ("UOW_PRE_PING", "false"),
        ]
        .into_iter()
        .collect();

        let config = DatabaseConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.dsn, "postgres://db/app");
        assert_eq!(config.pool, PoolOptions::new(1).max_overflow(0).acquire_timeout(Duration::from_millis(1500)).pre_ping(false));
    }

    #[test]
    fn missing_dsn_and_bad_numbers_fail() {
        assert!(DatabaseConfig::from_lookup(|_| None).is_err());

        let err = DatabaseConfig::from_lookup(|k| match k {
            "DATABASE_URL" => Some("postgres://db".into()),
            "UOW_POOL_SIZE" => Some("many".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("UOW_POOL_SIZE"));
    }
}
