/// Pipeline configuration loader - parses etl.toml plus environment overrides.
///
/// Keeps endpoint, retry bounds, store settings and request defaults out of
/// the code. Everything is gathered into one immutable `EtlConfig` that is
/// handed to the fetcher and loader constructors; nothing reads the
/// environment after startup.
///
/// Credentials (`DATABASE_URL`, `UPSTREAM_API_KEY`) are only ever taken from
/// the environment (or `.env`), never from the TOML file.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{DEFAULT_LATITUDE, DEFAULT_LONGITUDE, DEFAULT_METRICS, DEFAULT_WINDOW_DAYS};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_PATH: &str = "etl.toml";

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_COLLECTION_NAME: &str = "COLLECTION_NAME";
pub const ENV_UPSTREAM_BASE_URL: &str = "UPSTREAM_BASE_URL";
pub const ENV_UPSTREAM_API_KEY: &str = "UPSTREAM_API_KEY";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Upstream HTTP API settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Passed through as Open-Meteo's `timezone` parameter.
    pub timezone: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Bearer credential for alternate upstreams. Environment only.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            timezone: "auto".to_string(),
            timeout_secs: 30,
            user_agent: concat!("meteo_etl/", env!("CARGO_PKG_VERSION")).to_string(),
            api_key: None,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry bounds shared by the fetcher and the loader.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_retry_after_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 250,
            max_retry_after_secs: 60,
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Destination collection (one per connector).
    pub collection: String,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
    /// Environment only.
    #[serde(skip)]
    pub database_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection: "open_meteo_raw".to_string(),
            connect_timeout_secs: 5,
            statement_timeout_secs: 30,
            database_url: None,
        }
    }
}

impl StoreConfig {
    /// The configured database URL, checked for a PostgreSQL scheme.
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
            return Err(ConfigError::InvalidDatabaseUrl(url.to_string()));
        }
        Ok(url)
    }
}

/// Values used when the caller leaves request parameters out.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub metrics: Vec<String>,
    pub window_days: i64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            metrics: DEFAULT_METRICS.iter().map(|m| m.to_string()).collect(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EtlConfig {
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub defaults: DefaultsConfig,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl EtlConfig {
    /// Parses a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(origin.to_path_buf(), e))
    }

    /// Reads `path` if given (it must exist), otherwise `etl.toml` in the
    /// working directory if present, otherwise built-in defaults.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        Self::from_toml_str(&contents, &path)
    }

    /// Full startup load: `.env`, config file, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides through `lookup`, so tests can supply a
    /// map instead of mutating the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_DATABASE_URL) {
            self.store.database_url = Some(url);
        }
        if let Some(collection) = non_empty(ENV_COLLECTION_NAME) {
            self.store.collection = collection;
        }
        if let Some(base_url) = non_empty(ENV_UPSTREAM_BASE_URL) {
            self.upstream.base_url = base_url;
        }
        if let Some(key) = non_empty(ENV_UPSTREAM_API_KEY) {
            self.upstream.api_key = Some(key);
        }
    }

    /// Checks values the rest of the pipeline relies on. The database URL
    /// is checked later, only when a real store is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_collection_name(&self.store.collection) {
            return Err(ConfigError::InvalidValue {
                field: "store.collection",
                reason: format!(
                    "'{}' must match [a-z_][a-z0-9_]* (max {} chars)",
                    self.store.collection, MAX_COLLECTION_NAME_LEN
                ),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                field: "upstream.base_url",
                reason: format!("'{}' is not an http(s) URL", self.upstream.base_url),
            });
        }
        if self.defaults.window_days < 0 {
            return Err(ConfigError::InvalidValue {
                field: "defaults.window_days",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Longest collection name whose derived index name
/// (`<collection>_uniq_source_lat_lon_ts`) still fits PostgreSQL's 63-byte
/// identifier limit.
pub const MAX_COLLECTION_NAME_LEN: usize = 40;

/// Collection names are interpolated into SQL as table identifiers.
pub fn is_valid_collection_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_COLLECTION_NAME_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_builtin_defaults() {
        let config = EtlConfig::default();
        assert_eq!(config.upstream.base_url, "https://api.open-meteo.com/v1/forecast");
        assert_eq!(config.store.collection, "open_meteo_raw");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.defaults.latitude, 13.0827);
        assert_eq!(config.defaults.longitude, 80.2707);
        assert_eq!(
            config.defaults.metrics,
            vec!["temperature_2m".to_string(), "relative_humidity_2m".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults_for_missing_keys() {
        let toml = r#"
            [retry]
            max_attempts = 3

            [defaults]
            latitude = 51.5
            longitude = -0.12
        "#;
        let config = EtlConfig::from_toml_str(toml, Path::new("inline")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.defaults.latitude, 51.5);
        assert_eq!(config.defaults.window_days, 7);
        assert_eq!(config.store.collection, "open_meteo_raw");
    }

    #[test]
    fn test_toml_cannot_carry_credentials() {
        let toml = r#"
            [store]
            database_url = "postgres://leak@localhost/db"
        "#;
        let config = EtlConfig::from_toml_str(toml, Path::new("inline")).unwrap();
        assert!(config.store.database_url.is_none());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = EtlConfig::from_toml_str("[retry\nmax_attempts = ", Path::new("bad.toml"));
        assert!(matches!(result, Err(ConfigError::Parse(_, _))));
    }

    #[test]
    fn test_from_file_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\ncollection = \"weather_chennai\"").unwrap();

        let config = EtlConfig::from_file(Some(file.path())).unwrap();
        assert_eq!(config.store.collection, "weather_chennai");
    }

    #[test]
    fn test_from_file_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = EtlConfig::from_file(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Read(_, _))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgresql://etl:pw@localhost/etl_db"),
            ("COLLECTION_NAME", "open_meteo_test"),
            ("UPSTREAM_API_KEY", "secret"),
            ("UPSTREAM_BASE_URL", "   "),
        ]);
        let mut config = EtlConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.database_url().unwrap(), "postgresql://etl:pw@localhost/etl_db");
        assert_eq!(config.store.collection, "open_meteo_test");
        assert_eq!(config.upstream.api_key.as_deref(), Some("secret"));
        assert_eq!(
            config.upstream.base_url, "https://api.open-meteo.com/v1/forecast",
            "blank overrides are ignored"
        );
    }

    #[test]
    fn test_database_url_validation() {
        let mut store = StoreConfig::default();
        assert!(matches!(store.database_url(), Err(ConfigError::MissingDatabaseUrl)));

        store.database_url = Some("mongodb://localhost:27017/".to_string());
        assert!(matches!(store.database_url(), Err(ConfigError::InvalidDatabaseUrl(_))));

        store.database_url = Some("postgres://u:p@localhost/db".to_string());
        assert!(store.database_url().is_ok());
    }

    #[test]
    fn test_collection_name_rules() {
        assert!(is_valid_collection_name("open_meteo_raw"));
        assert!(is_valid_collection_name("_weather2"));
        assert!(!is_valid_collection_name(""));
        assert!(!is_valid_collection_name("2weather"));
        assert!(!is_valid_collection_name("Weather"));
        assert!(!is_valid_collection_name("raw; DROP TABLE x"));
        assert!(is_valid_collection_name(&"a".repeat(40)));
        assert!(!is_valid_collection_name(&"a".repeat(41)));
    }

    #[test]
    fn test_index_name_of_longest_collection_fits_identifier_limit() {
        let index = format!("{}_uniq_source_lat_lon_ts", "a".repeat(MAX_COLLECTION_NAME_LEN));
        assert!(index.len() <= 63, "{} bytes", index.len());

        let mut config = EtlConfig::default();
        config.store.collection = format!("{}_a", "open_meteo_raw_".repeat(3));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "store.collection", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_bad_url() {
        let mut config = EtlConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "retry.max_attempts", .. })
        ));

        let mut config = EtlConfig::default();
        config.upstream.base_url = "ftp://example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "upstream.base_url", .. })
        ));
    }
}
