//! Storage configuration parsed from a key lookup.
//!
//! # Responsibility
//! - Resolve the storage provider identifier exactly once per `StorageConfig`.
//! - Parse backend settings into typed structs with defaults.
//!
//! # Invariants
//! - Parsing is a pure function of the lookup; nothing global is read except
//!   through [`StorageConfig::from_env`].
//! - Provider matching is exact: `sqlite` or `dynamodb`, nothing else.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const PROVIDER_KEY: &str = "IDP_DATABASE_PROVIDER";
pub const SQLITE_PATH_KEY: &str = "IDP_SQLITE_PATH";
pub const SQLITE_POOL_MAX_SIZE_KEY: &str = "IDP_SQLITE_POOL_MAX_SIZE";
pub const SQLITE_POOL_ACQUIRE_TIMEOUT_KEY: &str = "IDP_SQLITE_POOL_ACQUIRE_TIMEOUT_MS";
pub const SQLITE_BUSY_TIMEOUT_KEY: &str = "IDP_SQLITE_BUSY_TIMEOUT_MS";
pub const SQLITE_MAX_RECORD_BYTES_KEY: &str = "IDP_SQLITE_MAX_RECORD_BYTES";
pub const DYNAMODB_REGION_KEY: &str = "IDP_DYNAMODB_REGION";
pub const DYNAMODB_ENDPOINT_KEY: &str = "IDP_DYNAMODB_ENDPOINT";
pub const DYNAMODB_TABLE_PREFIX_KEY: &str = "IDP_DYNAMODB_TABLE_PREFIX";
pub const DYNAMODB_MAX_CONCURRENCY_KEY: &str = "IDP_DYNAMODB_MAX_CONCURRENCY";
pub const DYNAMODB_ACQUIRE_TIMEOUT_KEY: &str = "IDP_DYNAMODB_ACQUIRE_TIMEOUT_MS";
pub const DYNAMODB_MAX_RETRIES_KEY: &str = "IDP_DYNAMODB_MAX_RETRIES";
pub const DYNAMODB_INITIAL_BACKOFF_KEY: &str = "IDP_DYNAMODB_INITIAL_BACKOFF_MS";
pub const DYNAMODB_MAX_BACKOFF_KEY: &str = "IDP_DYNAMODB_MAX_BACKOFF_MS";
pub const LOG_LEVEL_KEY: &str = "IDP_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "IDP_LOG_DIR";

/// Endpoint scheme that selects the in-process key-value engine.
pub const MEMORY_ENDPOINT_SCHEME: &str = "memory://";

const SQLITE_IN_MEMORY: &str = ":memory:";

static REGION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z]{2}(-[a-z]+)+-[0-9]{1,2}$").expect("region pattern must compile")
});
static TABLE_PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{0,200}$").expect("prefix pattern must compile"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("IDP_DATABASE_PROVIDER is not set; expected one of: sqlite, dynamodb")]
    MissingProvider,

    #[error(
        "unsupported storage provider `{value}` in IDP_DATABASE_PROVIDER; expected one of: sqlite, dynamodb"
    )]
    UnsupportedProvider { value: String },

    #[error("missing required setting {key} for provider {provider}")]
    Missing {
        key: &'static str,
        provider: StorageProvider,
    },

    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The two supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    Sqlite,
    DynamoDb,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::DynamoDb => "dynamodb",
        }
    }

    /// Resolves the raw configuration value. Surrounding whitespace is not
    /// trimmed and case is significant.
    pub fn parse(raw: Option<&str>) -> ConfigResult<Self> {
        match raw {
            None => Err(ConfigError::MissingProvider),
            Some("sqlite") => Ok(Self::Sqlite),
            Some("dynamodb") => Ok(Self::DynamoDb),
            Some(other) => Err(ConfigError::UnsupportedProvider {
                value: other.to_string(),
            }),
        }
    }
}

impl Display for StorageProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    /// Shared-cache in-memory database private to one `Storage`.
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub location: SqliteLocation,
    pub pool_max_size: usize,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
    pub max_record_bytes: usize,
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self {
            location: SqliteLocation::Memory,
            pool_max_size: 10,
            acquire_timeout: Duration::from_millis(5_000),
            busy_timeout: Duration::from_millis(5_000),
            max_record_bytes: 1_048_576,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SqliteLocation::File(path.into()),
            ..Self::in_memory()
        }
    }
}

/// Retry schedule for throttled key-value requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(5_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamoConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub table_prefix: String,
    pub max_concurrency: usize,
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl DynamoConfig {
    /// Settings for the in-process engine, used by local runs and tests.
    pub fn in_memory(table_prefix: impl Into<String>) -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: Some(format!("{MEMORY_ENDPOINT_SCHEME}local")),
            table_prefix: table_prefix.into(),
            max_concurrency: 64,
            acquire_timeout: Duration::from_millis(5_000),
            retry: RetryPolicy::default(),
        }
    }

    pub fn uses_memory_engine(&self) -> bool {
        self.endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.starts_with(MEMORY_ENDPOINT_SCHEME))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Sqlite(SqliteConfig),
    DynamoDb(DynamoConfig),
}

/// Fully resolved storage settings for one process or test.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: BackendConfig,
}

impl StorageConfig {
    pub fn sqlite(config: SqliteConfig) -> Self {
        Self {
            backend: BackendConfig::Sqlite(config),
        }
    }

    pub fn dynamodb(config: DynamoConfig) -> Self {
        Self {
            backend: BackendConfig::DynamoDb(config),
        }
    }

    pub fn provider(&self) -> StorageProvider {
        match self.backend {
            BackendConfig::Sqlite(_) => StorageProvider::Sqlite,
            BackendConfig::DynamoDb(_) => StorageProvider::DynamoDb,
        }
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses settings from an arbitrary key lookup.
    ///
    /// # Errors
    /// - Missing or unsupported provider value.
    /// - Missing provider-specific required settings.
    /// - Unparseable numbers, malformed region or table prefix.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = StorageProvider::parse(lookup(PROVIDER_KEY).as_deref())?;
        let backend = match provider {
            StorageProvider::Sqlite => BackendConfig::Sqlite(parse_sqlite(&lookup)?),
            StorageProvider::DynamoDb => BackendConfig::DynamoDb(parse_dynamo(&lookup)?),
        };
        Ok(Self { backend })
    }
}

fn parse_sqlite<F>(lookup: &F) -> ConfigResult<SqliteConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let raw_path = required(lookup, SQLITE_PATH_KEY, StorageProvider::Sqlite)?;
    let location = if raw_path == SQLITE_IN_MEMORY {
        SqliteLocation::Memory
    } else {
        SqliteLocation::File(PathBuf::from(raw_path))
    };

    let defaults = SqliteConfig::in_memory();
    let pool_max_size = positive(lookup, SQLITE_POOL_MAX_SIZE_KEY, defaults.pool_max_size)?;
    let acquire_timeout = millis(lookup, SQLITE_POOL_ACQUIRE_TIMEOUT_KEY, defaults.acquire_timeout)?;
    let busy_timeout = millis(lookup, SQLITE_BUSY_TIMEOUT_KEY, defaults.busy_timeout)?;
    let max_record_bytes = positive(
        lookup,
        SQLITE_MAX_RECORD_BYTES_KEY,
        defaults.max_record_bytes,
    )?;

    Ok(SqliteConfig {
        location,
        pool_max_size,
        acquire_timeout,
        busy_timeout,
        max_record_bytes,
    })
}

fn parse_dynamo<F>(lookup: &F) -> ConfigResult<DynamoConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let region = required(lookup, DYNAMODB_REGION_KEY, StorageProvider::DynamoDb)?;
    if !REGION_PATTERN.is_match(&region) {
        return Err(ConfigError::Invalid {
            key: DYNAMODB_REGION_KEY,
            value: region,
            reason: "expected an AWS region code such as us-east-1".to_string(),
        });
    }

    let endpoint = lookup(DYNAMODB_ENDPOINT_KEY).filter(|value| !value.trim().is_empty());
    let table_prefix = lookup(DYNAMODB_TABLE_PREFIX_KEY).unwrap_or_else(|| "idp_".to_string());
    if !TABLE_PREFIX_PATTERN.is_match(&table_prefix) {
        return Err(ConfigError::Invalid {
            key: DYNAMODB_TABLE_PREFIX_KEY,
            value: table_prefix,
            reason: "allowed characters are A-Z a-z 0-9 _ . -".to_string(),
        });
    }

    let defaults = DynamoConfig::in_memory("");
    let max_concurrency = positive(lookup, DYNAMODB_MAX_CONCURRENCY_KEY, defaults.max_concurrency)?;
    let acquire_timeout = millis(lookup, DYNAMODB_ACQUIRE_TIMEOUT_KEY, defaults.acquire_timeout)?;
    let retry_defaults = RetryPolicy::default();
    let max_retries = number::<F, u32>(lookup, DYNAMODB_MAX_RETRIES_KEY)?
        .unwrap_or(retry_defaults.max_retries);
    let initial_backoff = millis(
        lookup,
        DYNAMODB_INITIAL_BACKOFF_KEY,
        retry_defaults.initial_backoff,
    )?;
    let max_backoff = millis(lookup, DYNAMODB_MAX_BACKOFF_KEY, retry_defaults.max_backoff)?;
    if max_backoff < initial_backoff {
        return Err(ConfigError::Invalid {
            key: DYNAMODB_MAX_BACKOFF_KEY,
            value: max_backoff.as_millis().to_string(),
            reason: format!(
                "must not be below {DYNAMODB_INITIAL_BACKOFF_KEY} ({} ms)",
                initial_backoff.as_millis()
            ),
        });
    }

    Ok(DynamoConfig {
        region,
        endpoint,
        table_prefix,
        max_concurrency,
        acquire_timeout,
        retry: RetryPolicy {
            max_retries,
            initial_backoff,
            max_backoff,
            multiplier: retry_defaults.multiplier,
        },
    })
}

fn required<F>(lookup: &F, key: &'static str, provider: StorageProvider) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing { key, provider }),
    }
}

fn number<F, T>(lookup: &F, key: &'static str) -> ConfigResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: err.to_string(),
            }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: usize) -> ConfigResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match number::<F, usize>(lookup, key)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> ConfigResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number::<F, u64>(lookup, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

/// Logging settings consumed by binaries before the store is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            level: lookup(LOG_LEVEL_KEY).unwrap_or_else(|| "info".to_string()),
            dir: lookup(LOG_DIR_KEY)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BackendConfig, ConfigError, SqliteLocation, StorageConfig, StorageProvider,
    };
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn provider_matching_is_exact() {
        assert_eq!(
            StorageProvider::parse(Some("sqlite")),
            Ok(StorageProvider::Sqlite)
        );
        for raw in ["SQLite", "dynamo", "", " sqlite"] {
            let err = StorageProvider::parse(Some(raw)).expect_err("value must be rejected");
            let message = err.to_string();
            assert!(message.contains(&format!("`{raw}`")));
            assert!(message.contains("sqlite"));
            assert!(message.contains("dynamodb"));
        }
        assert_eq!(StorageProvider::parse(None), Err(ConfigError::MissingProvider));
    }

    #[test]
    fn sqlite_defaults_apply() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("IDP_DATABASE_PROVIDER", "sqlite"),
            ("IDP_SQLITE_PATH", ":memory:"),
        ]))
        .expect("config should parse");
        let BackendConfig::Sqlite(sqlite) = config.backend else {
            panic!("expected sqlite backend");
        };
        assert_eq!(sqlite.location, SqliteLocation::Memory);
        assert_eq!(sqlite.pool_max_size, 10);
        assert_eq!(sqlite.acquire_timeout, Duration::from_millis(5_000));
        assert_eq!(sqlite.max_record_bytes, 1_048_576);
    }

    #[test]
    fn dynamodb_requires_region() {
        let err = StorageConfig::from_lookup(lookup(&[("IDP_DATABASE_PROVIDER", "dynamodb")]))
            .expect_err("region is required");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "IDP_DYNAMODB_REGION",
                provider: StorageProvider::DynamoDb,
            }
        );
    }

    #[test]
    fn dynamodb_rejects_malformed_region_and_prefix() {
        let region_err = StorageConfig::from_lookup(lookup(&[
            ("IDP_DATABASE_PROVIDER", "dynamodb"),
            ("IDP_DYNAMODB_REGION", "US_EAST"),
        ]))
        .expect_err("region should be rejected");
        assert!(matches!(region_err, ConfigError::Invalid { key: "IDP_DYNAMODB_REGION", .. }));

        let prefix_err = StorageConfig::from_lookup(lookup(&[
            ("IDP_DATABASE_PROVIDER", "dynamodb"),
            ("IDP_DYNAMODB_REGION", "eu-west-1"),
            ("IDP_DYNAMODB_TABLE_PREFIX", "bad prefix"),
        ]))
        .expect_err("prefix should be rejected");
        assert!(matches!(
            prefix_err,
            ConfigError::Invalid { key: "IDP_DYNAMODB_TABLE_PREFIX", .. }
        ));
    }

    #[test]
    fn dynamodb_parses_retry_settings() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("IDP_DATABASE_PROVIDER", "dynamodb"),
            ("IDP_DYNAMODB_REGION", "us-gov-west-1"),
            ("IDP_DYNAMODB_ENDPOINT", "memory://test"),
            ("IDP_DYNAMODB_MAX_RETRIES", "5"),
            ("IDP_DYNAMODB_INITIAL_BACKOFF_MS", "10"),
            ("IDP_DYNAMODB_MAX_BACKOFF_MS", "40"),
        ]))
        .expect("config should parse");
        let BackendConfig::DynamoDb(dynamo) = config.backend else {
            panic!("expected dynamodb backend");
        };
        assert!(dynamo.uses_memory_engine());
        assert_eq!(dynamo.table_prefix, "idp_");
        assert_eq!(dynamo.retry.max_retries, 5);
        assert_eq!(dynamo.retry.backoff_for(0), Duration::from_millis(10));
        assert_eq!(dynamo.retry.backoff_for(1), Duration::from_millis(20));
        assert_eq!(dynamo.retry.backoff_for(5), Duration::from_millis(40));
    }

    #[test]
    fn invalid_number_names_key_and_value() {
        let err = StorageConfig::from_lookup(lookup(&[
            ("IDP_DATABASE_PROVIDER", "sqlite"),
            ("IDP_SQLITE_PATH", "/tmp/idp.db"),
            ("IDP_SQLITE_POOL_MAX_SIZE", "ten"),
        ]))
        .expect_err("pool size should be rejected");
        let message = err.to_string();
        assert!(message.contains("IDP_SQLITE_POOL_MAX_SIZE"));
        assert!(message.contains("ten"));
    }
}
