//! Configuration management for quotaguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{QuotaError, Result};
use crate::ratelimit::{FailoverSettings, PolicyConfig};

/// Environment variable prefix for layered configuration.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Conventional variable holding the distributed store URL.
pub const REDIS_URL_VAR: &str = "REDIS_URL";

/// Main configuration for quotaguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Distributed store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local fallback store configuration
    #[serde(default)]
    pub local: LocalStoreConfig,

    /// Named policies; entries named after a preset override it
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Distributed store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; unset means local-only operation
    #[serde(default)]
    pub url: Option<String>,

    /// Bound on one connection attempt in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on one check-and-record transaction in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Consecutive operation failures before reconnecting
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Longest reconnect delay in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            failure_threshold: default_failure_threshold(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_operation_timeout() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    200
}

fn default_backoff_max() -> u64 {
    10_000
}

impl StoreConfig {
    /// The configured URL, treating an empty string as unset.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn failover_settings(&self) -> FailoverSettings {
        FailoverSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            failure_threshold: self.failure_threshold,
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Local fallback store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Buckets held before an access sweeps idle ones
    #[serde(default = "default_sweep_threshold")]
    pub sweep_threshold: usize,

    /// Background sweep interval in seconds; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            sweep_threshold: default_sweep_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_threshold() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotaGuardConfig {
    /// Load configuration from an optional YAML file, then
    /// `QUOTAGUARD__SECTION__KEY` environment variables, then `REDIS_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: QuotaGuardConfig = builder.build()?.try_deserialize()?;
        config.apply_redis_url(std::env::var(REDIS_URL_VAR).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Use `url` as the store URL when none is configured.
    pub fn apply_redis_url(&mut self, url: Option<String>) {
        if self.store.url().is_none() {
            if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
                self.store.url = Some(url);
            }
        }
    }

    /// Reject values that would make the limiter misbehave.
    pub fn validate(&self) -> Result<()> {
        let store = &self.store;
        if store.connect_timeout_ms == 0 || store.operation_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "store timeouts must be positive".to_string(),
            ));
        }
        if store.failure_threshold == 0 {
            return Err(QuotaError::Config(
                "store.failure_threshold must be at least 1".to_string(),
            ));
        }
        if store.backoff_base_ms > store.backoff_max_ms {
            return Err(QuotaError::Config(
                "store.backoff_base_ms must not exceed store.backoff_max_ms".to_string(),
            ));
        }
        for (name, policy) in &self.policies {
            policy.to_policy(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_layers_file_then_env_then_redis_url() {
        let path = std::env::temp_dir().join(format!("quotaguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
store:
  operation_timeout_ms: 250
policies:
  uploads:
    window_ms: 1000
    max_requests: 2
"#,
        )
        .unwrap();
        let saved_redis_url = std::env::var(REDIS_URL_VAR).ok();

        std::env::set_var("QUOTAGUARD__STORE__URL", "redis://env-host:6379");
        std::env::set_var("QUOTAGUARD__POLICIES__UPLOADS__WINDOW_MS", "5000");
        std::env::set_var(REDIS_URL_VAR, "redis://fallback:6379");

        let layered = QuotaGuardConfig::load(Some(&path));

        // Without an explicit store URL, REDIS_URL fills it in.
        std::env::remove_var("QUOTAGUARD__STORE__URL");
        let fallback = QuotaGuardConfig::load(Some(&path));

        std::env::remove_var("QUOTAGUARD__POLICIES__UPLOADS__WINDOW_MS");
        match saved_redis_url {
            Some(url) => std::env::set_var(REDIS_URL_VAR, url),
            None => std::env::remove_var(REDIS_URL_VAR),
        }
        std::fs::remove_file(&path).unwrap();

        let layered = layered.unwrap();
        assert_eq!(layered.store.url(), Some("redis://env-host:6379"));
        assert_eq!(layered.store.operation_timeout_ms, 250);
        let uploads = &layered.policies["uploads"];
        assert_eq!(uploads.window_ms, 5000);
        assert_eq!(uploads.max_requests, 2);

        let fallback = fallback.unwrap();
        assert_eq!(fallback.store.url(), Some("redis://fallback:6379"));
        assert_eq!(fallback.store.operation_timeout_ms, 250);
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let path = std::env::temp_dir().join(format!("quotaguard-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert!(QuotaGuardConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = QuotaGuardConfig::default();
        assert!(config.store.url().is_none());
        assert_eq!(config.store.operation_timeout_ms, 500);
        assert_eq!(config.local.sweep_threshold, 10_000);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  url: redis://cache:6379
  operation_timeout_ms: 250
local:
  sweep_interval_secs: 0
policies:
  strict:
    window_ms: 60000
    max_requests: 2
  uploads:
    window_ms: 1000
    max_requests: 1
    key_prefix: rl:up
logging:
  format: json
"#;
        let config = QuotaGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.url(), Some("redis://cache:6379"));
        assert_eq!(config.store.operation_timeout_ms, 250);
        assert_eq!(config.store.failure_threshold, 3);
        assert_eq!(config.local.sweep_interval_secs, 0);
        assert_eq!(config.policies["uploads"].key_prefix.as_deref(), Some("rl:up"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
policies:
  broken:
    window_ms: 0
    max_requests: 1
"#;
        let err = QuotaGuardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidPolicy(_)));
    }

    #[test]
    fn test_invalid_store_settings_rejected() {
        let mut config = QuotaGuardConfig::default();
        config.store.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(QuotaError::Config(_))));

        let mut config = QuotaGuardConfig::default();
        config.store.backoff_base_ms = 20_000;
        assert!(matches!(config.validate(), Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_empty_url_is_unset() {
        let mut config = QuotaGuardConfig::default();
        config.store.url = Some("   ".to_string());
        assert!(config.store.url().is_none());

        config.apply_redis_url(Some("redis://fallback:6379".to_string()));
        assert_eq!(config.store.url(), Some("redis://fallback:6379"));

        config.apply_redis_url(Some("redis://ignored:6379".to_string()));
        assert_eq!(config.store.url(), Some("redis://fallback:6379"));
    }

    #[test]
    fn test_failover_settings_conversion() {
        let settings = StoreConfig::default().failover_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.backoff_max, Duration::from_secs(10));
        assert_eq!(settings.failure_threshold, 3);
    }
}
