use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::AuditError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub sequencer: SequencerConfig,
    pub verification: VerificationConfig,
    pub query: QueryConfig,
}

/// Bounds for the optimistic append retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub append_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub batch_size: u32,
    pub integrity_refresh_secs: u64,
    pub integrity_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub recent_activity_window_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            sequencer: SequencerConfig::default(),
            verification: VerificationConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 200,
            append_timeout_ms: 5_000,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            integrity_refresh_secs: 300,
            integrity_max_age_secs: 600,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            recent_activity_window_hours: 24,
        }
    }
}

impl SequencerConfig {
    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }
}

impl VerificationConfig {
    pub fn integrity_max_age(&self) -> Duration {
        Duration::from_secs(self.integrity_max_age_secs)
    }

    pub fn integrity_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_refresh_secs)
    }
}

impl AppConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `AUDIT_*` environment variables (`__` separates nested keys).
    pub fn load() -> Result<Self, AuditError> {
        let path = env::var("AUDIT_CONFIG_FILE").unwrap_or_else(|_| "audit.yaml".to_string());

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(&path).required(false))
            .add_source(
                ::config::Environment::with_prefix("AUDIT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AuditError::Config(format!("Failed to read configuration: {}", e)))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| AuditError::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.database_url.trim().is_empty() {
            return Err(AuditError::Config("database_url must be set".to_string()));
        }
        if self.sequencer.max_attempts == 0 {
            return Err(AuditError::Config(
                "sequencer.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sequencer.base_backoff_ms > self.sequencer.max_backoff_ms {
            return Err(AuditError::Config(format!(
                "sequencer.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.sequencer.base_backoff_ms, self.sequencer.max_backoff_ms
            )));
        }
        if self.verification.batch_size == 0 {
            return Err(AuditError::Config(
                "verification.batch_size must be at least 1".to_string(),
            ));
        }
        if self.query.default_page_size == 0 || self.query.default_page_size > self.query.max_page_size {
            return Err(AuditError::Config(format!(
                "query.default_page_size ({}) must be between 1 and max_page_size ({})",
                self.query.default_page_size, self.query.max_page_size
            )));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sequencer.max_attempts, 5);
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = AppConfig::default();
        config.sequencer.max_attempts = 0;
        assert!(matches!(config.validate(), Err(AuditError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_page_sizes() {
        let mut config = AppConfig::default();
        config.query.default_page_size = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "server_port: 8080\nsequencer:\n  max_attempts: 3\n";
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.server_port, 8080);
        assert_eq!(config.sequencer.max_attempts, 3);
        assert_eq!(config.sequencer.base_backoff_ms, 10);
        assert_eq!(config.verification.batch_size, 500);
    }
}
