//! Configuration management for Floodgate.
//!
//! Everything has an in-code default; a YAML file, when given, is read
//! once at startup and only overrides the fields it names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::rules::{default_client_budget, default_operations, WindowRule};

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// When false, collaborators get a throttle that grants everything
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default per-user response cooldown in milliseconds
    #[serde(default = "default_response_cooldown_ms")]
    pub response_cooldown_ms: u64,

    /// Operation category table
    #[serde(default = "default_operations")]
    pub operations: BTreeMap<String, WindowRule>,

    /// Per-client request budget
    #[serde(default = "default_client_budget")]
    pub client_budget: WindowRule,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            response_cooldown_ms: default_response_cooldown_ms(),
            operations: default_operations(),
            client_budget: default_client_budget(),
        }
    }
}

impl LimiterConfig {
    /// The default response cooldown as a `Duration`.
    pub fn response_cooldown(&self) -> Duration {
        Duration::from_millis(self.response_cooldown_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_response_cooldown_ms() -> u64 {
    2000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule in the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in &self.limiter.operations {
            rule.validate(name)?;
        }
        self.limiter.client_budget.validate("client_budget")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::SEND_MESSAGE;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert!(config.limiter.enabled);
        assert_eq!(config.limiter.response_cooldown(), Duration::from_secs(2));
        assert_eq!(config.limiter.operations.len(), 3);
        assert_eq!(config.limiter.client_budget, WindowRule::new(20, 60));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = FloodgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter.operations, default_operations());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
limiter:
  response_cooldown_ms: 500
  operations:
    send_message:
      max_requests: 30
      window_secs: 1
logging:
  json: true
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert!(config.limiter.enabled);
        assert_eq!(config.limiter.response_cooldown_ms, 500);
        // Naming the table replaces it wholesale.
        assert_eq!(config.limiter.operations.len(), 1);
        assert_eq!(config.limiter.operations[SEND_MESSAGE], WindowRule::new(30, 1));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let yaml = r#"
limiter:
  operations:
    send_message:
      max_requests: 0
      window_secs: 5
"#;
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(FloodgateConfig::from_yaml("limiter: [1, 2").is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  enabled: false\n").unwrap();

        let config = FloodgateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.operations, default_operations());
    }

    #[test]
    fn test_missing_file() {
        let err = FloodgateConfig::from_file("/nonexistent/floodgate.yaml").unwrap_err();
        assert!(matches!(err, FloodgateError::Io(_)));
    }
}
