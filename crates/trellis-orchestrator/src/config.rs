//! Orchestrator configuration
//!
//! Handles loading and validation of orchestrator configuration from
//! environment variables, an optional configuration file, and defaults.
//! Durations are configured as integer seconds (`*_SECS` variables).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use trellis_workflow::{ExecutorConfig, RegistryConfig, ServiceTimeouts};

/// Main orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum live (non-terminal) executions (`MAX_CONCURRENT_WORKFLOWS`).
    pub max_concurrent_workflows: usize,

    /// Workflow timeout applied when a definition declares none
    /// (`DEFAULT_WORKFLOW_TIMEOUT_SECS`).
    pub default_workflow_timeout_secs: u64,

    /// Retention of terminal execution records (`EXECUTION_TTL_SECS`).
    pub execution_ttl_secs: u64,

    /// Registry cleanup interval (`CLEANUP_INTERVAL_SECS`).
    pub cleanup_interval_secs: u64,

    /// Default data service call timeout (`DATA_TIMEOUT_SECS`).
    pub data_timeout_secs: u64,

    /// Default AI service call timeout (`AI_TIMEOUT_SECS`).
    pub ai_timeout_secs: u64,

    /// Default execution service call timeout (`EXEC_TIMEOUT_SECS`).
    pub exec_timeout_secs: u64,

    /// Grace period for in-flight tasks on cancellation
    /// (`SHUTDOWN_TIMEOUT_SECS`).
    pub shutdown_timeout_secs: u64,

    /// Capability announcement interval
    /// (`CAPABILITY_REFRESH_INTERVAL_SECS`).
    pub capability_refresh_interval_secs: u64,

    /// Directory holding workflow template documents
    /// (`TEMPLATES_DIR`, or `ORCHESTRATOR_TEMPLATES`).
    pub templates_dir: PathBuf,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (json, pretty, compact).
    pub format: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            default_workflow_timeout_secs: 3600,
            execution_ttl_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
            data_timeout_secs: 60,
            ai_timeout_secs: 120,
            exec_timeout_secs: 300,
            shutdown_timeout_secs: 10,
            capability_refresh_interval_secs: 300,
            templates_dir: PathBuf::from("templates"),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from defaults, an optional config file and the
    /// environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            // Start with default values
            .add_source(config::Config::try_from(&OrchestratorConfig::default())?)
            // Add an optional config file
            .add_source(config::File::with_name("config/orchestrator").required(false))
            // Add environment variables (LOGGING__LEVEL style nesting)
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let mut loaded: Self = settings.try_deserialize()?;

        // Documented alias for the template directory.
        if let Ok(dir) = std::env::var("ORCHESTRATOR_TEMPLATES") {
            loaded.templates_dir = PathBuf::from(dir);
        }

        Ok(loaded)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_workflows == 0 {
            return Err("MAX_CONCURRENT_WORKFLOWS must be greater than 0".to_string());
        }
        if self.default_workflow_timeout_secs == 0 {
            return Err("DEFAULT_WORKFLOW_TIMEOUT_SECS must be greater than 0".to_string());
        }
        if self.cleanup_interval_secs == 0 {
            return Err("CLEANUP_INTERVAL_SECS must be greater than 0".to_string());
        }
        if self.templates_dir.as_os_str().is_empty() {
            return Err("TEMPLATES_DIR must not be empty".to_string());
        }
        Ok(())
    }

    /// Registry tunables derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_concurrent: self.max_concurrent_workflows,
            execution_ttl: Duration::from_secs(self.execution_ttl_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    /// Executor tunables derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_workflow_timeout: Duration::from_secs(self.default_workflow_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Per-service call timeouts derived from this configuration.
    pub fn service_timeouts(&self) -> ServiceTimeouts {
        ServiceTimeouts {
            data: Duration::from_secs(self.data_timeout_secs),
            ai: Duration::from_secs(self.ai_timeout_secs),
            exec: Duration::from_secs(self.exec_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_workflows, 10);
        assert_eq!(config.default_workflow_timeout_secs, 3600);
        assert_eq!(config.execution_ttl_secs, 86400);
        assert_eq!(config.data_timeout_secs, 60);
        assert_eq!(config.ai_timeout_secs, 120);
        assert_eq!(config.exec_timeout_secs, 300);
    }

    #[test]
    fn test_config_validation() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = OrchestratorConfig::default();
        invalid.max_concurrent_workflows = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_derived_tunables() {
        let config = OrchestratorConfig::default();

        let registry = config.registry_config();
        assert_eq!(registry.max_concurrent, 10);
        assert_eq!(registry.execution_ttl, Duration::from_secs(86400));

        let timeouts = config.service_timeouts();
        assert_eq!(timeouts.exec, Duration::from_secs(300));
    }
}
