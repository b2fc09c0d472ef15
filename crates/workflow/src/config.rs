//! Orchestrator configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! section is fine. A few environment variables override the file.

use std::path::Path;

use devflow_execution::{GraphConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::WorkflowConfig;
use crate::error::{Result, WorkflowError};

/// Log level override.
pub const ENV_LOG: &str = "DEVFLOW_LOG";
/// Task retry budget override.
pub const ENV_MAX_RETRIES: &str = "DEVFLOW_MAX_RETRIES";
/// Workflow stage retry budget override.
pub const ENV_WORKFLOW_MAX_RETRIES: &str = "DEVFLOW_WORKFLOW_MAX_RETRIES";

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// `[scheduler]`
    pub scheduler: SchedulerConfig,
    /// `[graph]`
    pub graph: GraphConfig,
    /// `[workflow]`
    pub workflow: WorkflowConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Load from `path`, falling back to defaults if it does not exist, then
    /// apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let s = std::fs::read_to_string(path)
                .map_err(|e| WorkflowError::Config(format!("{}: {}", path.display(), e)))?;
            Self::from_toml_str(&s)?
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Parse TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WorkflowError::Config(e.to_string()))
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_LOG) {
            if !v.trim().is_empty() {
                self.logging.level = v;
            }
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.scheduler.default_max_retries = parse_u32(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKFLOW_MAX_RETRIES) {
            self.workflow.max_retries = parse_u32(ENV_WORKFLOW_MAX_RETRIES, &v)?;
        }
        Ok(())
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkflowError::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::WorkflowStage;
    use devflow_execution::Backoff;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.scheduler.default_max_retries, 3);
        assert_eq!(cfg.scheduler.claim_attempts, 3);
        assert_eq!(cfg.graph.max_depth, 1000);
        assert_eq!(cfg.workflow.max_retries, 3);
        assert!(cfg.workflow.auto_advance);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_file() {
        let cfg = OrchestratorConfig::from_toml_str(
            r#"
            [scheduler]
            default_max_retries = 5
            backoff = { curve = "linear", base_secs = 10, max_secs = 120 }

            [workflow]
            auto_advance = false

            [workflow.timeout_secs]
            validation = 900
            "#,
        )
        .unwrap();

        assert_eq!(cfg.scheduler.default_max_retries, 5);
        assert_eq!(cfg.scheduler.backoff, Backoff::Linear { base_secs: 10, max_secs: 120 });
        assert_eq!(cfg.scheduler.claim_attempts, 3);
        assert!(!cfg.workflow.auto_advance);
        assert_eq!(cfg.workflow.timeout_override(WorkflowStage::Validation), Some(900));
        assert_eq!(cfg.workflow.timeout_override(WorkflowStage::Completion), None);
        assert_eq!(cfg.graph.max_depth, 1000);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("[scheduler\n").unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG, "debug"),
            (ENV_MAX_RETRIES, "7"),
            (ENV_WORKFLOW_MAX_RETRIES, "1"),
        ]);
        let mut cfg = OrchestratorConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.scheduler.default_max_retries, 7);
        assert_eq!(cfg.workflow.max_retries, 1);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut cfg = OrchestratorConfig::default();
        let err = cfg
            .apply_env_overrides(|k| (k == ENV_MAX_RETRIES).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_and_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = OrchestratorConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing.graph.max_depth, 1000);

        let path = dir.path().join("devflow.toml");
        std::fs::write(&path, "[graph]\nmax_depth = 50\n").unwrap();
        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.graph.max_depth, 50);
    }
}
