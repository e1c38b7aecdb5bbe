//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `AUTH_ENABLED`: Enables API key authentication on protected prefixes (default: false)
//! - `API_KEYS`: Comma-separated list of valid API keys
//! - `AUTH_PROTECTED_PREFIXES`: Comma-separated path prefixes requiring a key (default: `/mcp`)
//! - `AUTH_FAILURE_LIMIT_PER_MINUTE`: Failed attempts per client before lockout (default: 0 = off)
//! - `LOG_PAYLOADS`: Record tool arguments and request payloads on spans (default: false)
//!
//! # Admission Control
//!
//! - `RATE_LIMIT_ENABLED`: Enables per-client rate limiting (default: true)
//! - `RATE_LIMIT_RPS`: Sustained requests per second per client (default: 10)
//! - `RATE_LIMIT_BURST`: Bucket size per client (default: 20)
//! - `RATE_LIMIT_CLEANUP_INTERVAL_SECS`: Idle bucket sweep interval (default: 300)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Deployment environment label (default: "development")
    pub environment: String,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Whether per-client admission control is applied (default: true)
    pub rate_limit_enabled: bool,

    /// Tokens replenished per second per client (default: 10)
    pub rate_limit_rps: f64,

    /// Maximum tokens per client bucket (default: 20)
    pub rate_limit_burst: u32,

    /// How often idle client buckets are swept (default: 5 minutes)
    pub rate_limit_cleanup_interval: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Whether API key authentication is applied to protected prefixes
    pub auth_enabled: bool,

    /// Valid API keys. Passed via the `X-API-Key` header.
    pub api_keys: Vec<String>,

    /// Path prefixes that require a valid API key when auth is enabled.
    /// Default: ["/mcp"]
    pub auth_protected_prefixes: Vec<String>,

    /// Failed authentication attempts per client per minute before further
    /// attempts are rejected outright (0 = no lockout).
    pub auth_failure_limit_per_minute: u32,

    // =========================================================================
    // Request Limits Configuration
    // =========================================================================
    /// Maximum request body size in bytes (default: 4MB)
    pub max_request_body_size: usize,

    /// Upper bound on request handling time (default: 30 seconds)
    pub request_timeout: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Record tool arguments and full request payloads on spans.
    /// Off by default: arguments may carry credentials or personal data.
    pub log_payloads: bool,

    /// Log output format (default: text)
    pub log_format: LogFormat,

    /// Whether the Prometheus recorder is installed and `/metrics` served
    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value cannot be parsed or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            // Rate limiting
            rate_limit_enabled: Self::parse_env_bool("RATE_LIMIT_ENABLED", true)?,
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 10.0)?,
            // Signed so that zero or negative values reach the limiter's defaults
            rate_limit_burst: limiter_burst(Self::parse_env("RATE_LIMIT_BURST", 20)?),
            rate_limit_cleanup_interval: limiter_interval(Self::parse_env(
                "RATE_LIMIT_CLEANUP_INTERVAL_SECS",
                300,
            )?),

            // Security
            auth_enabled: Self::parse_env_bool("AUTH_ENABLED", false)?,
            api_keys: env::var("API_KEYS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            auth_protected_prefixes: env::var("AUTH_PROTECTED_PREFIXES")
                .map(|raw| parse_list(&raw))
                .unwrap_or_else(|_| vec!["/mcp".to_string()]),
            auth_failure_limit_per_minute: Self::parse_env("AUTH_FAILURE_LIMIT_PER_MINUTE", 0)?,

            // Request limits
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 4 * 1024 * 1024)?, // 4MB
            request_timeout: Duration::from_secs(Self::parse_env("REQUEST_TIMEOUT_SECS", 30)?),

            // Observability
            log_payloads: Self::parse_env_bool("LOG_PAYLOADS", false)?,
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Text)?,
            metrics_enabled: Self::parse_env_bool("METRICS_ENABLED", true)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if let Some(bad) = self
            .auth_protected_prefixes
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(AppError::ConfigError(format!(
                "AUTH_PROTECTED_PREFIXES entry '{bad}' must start with '/'"
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if API key authentication is enabled.
    pub fn auth_enabled(&self) -> bool {
        self.auth_enabled
    }

    /// Number of configured API keys.
    pub fn api_key_count(&self) -> usize {
        self.api_keys.len()
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a boolean environment variable (`true/1/yes/on`, `false/0/no/off`).
    fn parse_env_bool(name: &str, default: bool) -> AppResult<bool> {
        match env::var(name) {
            Ok(val) => parse_bool(&val).ok_or_else(|| {
                AppError::ConfigError(format!("Invalid {name}: expected a boolean, got '{val}'"))
            }),
            Err(_) => Ok(default),
        }
    }
}

/// Parse a permissive boolean value.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Non-positive burst maps to 0, which the limiter replaces with its default.
fn limiter_burst(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

/// Non-positive seconds map to zero, which the limiter replaces with its default.
fn limiter_interval(raw_secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(raw_secs).unwrap_or(0))
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            // Rate limiting
            rate_limit_enabled: true,
            rate_limit_rps: 10.0,
            rate_limit_burst: 20,
            rate_limit_cleanup_interval: Duration::from_secs(300),
            // Security
            auth_enabled: false,
            api_keys: vec![],
            auth_protected_prefixes: vec!["/mcp".to_string()],
            auth_failure_limit_per_minute: 0,
            // Request limits
            max_request_body_size: 4 * 1024 * 1024, // 4MB
            request_timeout: Duration::from_secs(30),
            // Observability
            log_payloads: false,
            log_format: LogFormat::Text,
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(config.rate_limit_enabled);
        assert_eq!(config.rate_limit_rps, 10.0);
        assert_eq!(config.rate_limit_burst, 20);
        assert_eq!(config.rate_limit_cleanup_interval, Duration::from_secs(300));
        assert!(!config.auth_enabled());
        assert!(!config.log_payloads);
        assert_eq!(config.auth_protected_prefixes, vec!["/mcp".to_string()]);
    }

    #[test]
    fn test_non_positive_limiter_values_fall_back_to_defaults() {
        use crate::middleware::RateLimiterConfig;

        let config = RateLimiterConfig::new(-1.0, limiter_burst(-1), limiter_interval(-5));
        assert_eq!(config.normalized(), RateLimiterConfig::default());

        let config = RateLimiterConfig::new(0.0, limiter_burst(0), limiter_interval(0));
        assert_eq!(config.normalized(), RateLimiterConfig::default());

        assert_eq!(limiter_burst(7), 7);
        assert_eq!(limiter_burst(i64::MAX), u32::MAX);
        assert_eq!(limiter_interval(60), Duration::from_secs(60));
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9090,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_parse_bool_variants() {
        for raw in ["true", "TRUE", "1", "yes", "On", " on "] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        assert_eq!(parse_list(" key1 , key2 , key3 "), vec!["key1", "key2", "key3"]);
        assert_eq!(parse_list("key1,,key2,  ,key3"), vec!["key1", "key2", "key3"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_api_key_count() {
        let config = Config {
            api_keys: vec!["a".to_string(), "b".to_string()],
            ..Config::default()
        };
        assert_eq!(config.api_key_count(), 2);
    }

    #[test]
    fn test_validate_body_size_zero() {
        let config = Config {
            max_request_body_size: 0,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("MAX_REQUEST_BODY_SIZE"));
    }

    #[test]
    fn test_validate_request_timeout_zero() {
        let config = Config {
            request_timeout: Duration::ZERO,
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_protected_prefix_must_be_absolute() {
        let config = Config {
            auth_protected_prefixes: vec!["mcp".to_string()],
            ..Config::default()
        };

        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("AUTH_PROTECTED_PREFIXES")
        );
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
