//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [sandbox]
//! max_operations = 100000
//!
//! [governance]
//! base_url = "https://metagov.example.org"
//! timeout_ms = 10000
//!
//! [engine]
//! emit_executed_action_triggers = true
//!
//! [scheduler]
//! interval_secs = 60
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `POLITY_GOVERNANCE_URL` and `POLITY_GOVERNANCE_TIMEOUT_MS` override the
//! governance section when set.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use polity_sandbox::Limits;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::governance::{DisabledGovernance, GovernanceService, HttpGovernanceService};

pub const GOVERNANCE_URL_VAR: &str = "POLITY_GOVERNANCE_URL";
pub const GOVERNANCE_TIMEOUT_VAR: &str = "POLITY_GOVERNANCE_TIMEOUT_MS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox: Limits,
    pub governance: GovernanceConfig,
    pub engine: EngineSettings,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Root of the governance service API. No service is used when unset.
    pub base_url: Option<String>,
    /// Bound on every call to the service.
    pub timeout_ms: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        GovernanceConfig {
            base_url: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Run trigger policies for every action executed during a pass.
    pub emit_executed_action_triggers: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            emit_executed_action_triggers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { interval_secs: 60 }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(GOVERNANCE_URL_VAR) {
            let url = url.trim().to_string();
            self.governance.base_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(raw) = lookup(GOVERNANCE_TIMEOUT_VAR) {
            self.governance.timeout_ms =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: GOVERNANCE_TIMEOUT_VAR,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    /// The governance service this configuration describes.
    pub fn governance_service(&self) -> Arc<dyn GovernanceService> {
        match &self.governance.base_url {
            Some(url) => Arc::new(HttpGovernanceService::new(
                url,
                Duration::from_millis(self.governance.timeout_ms),
            )),
            None => Arc::new(DisabledGovernance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.engine.emit_executed_action_triggers);
        assert_eq!(config.scheduler.interval(), Duration::from_secs(60));
        assert_eq!(config.sandbox.max_operations, 100_000);
    }

    #[test]
    fn sections_override_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [sandbox]
            max_operations = 500

            [governance]
            base_url = "http://localhost:8000"
            timeout_ms = 250

            [engine]
            emit_executed_action_triggers = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.max_operations, 500);
        assert_eq!(config.sandbox.max_string_len, 1_000_000);
        assert_eq!(config.governance.base_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.governance.timeout_ms, 250);
        assert!(!config.engine.emit_executed_action_triggers);
    }

    #[test]
    fn environment_overrides_governance() {
        let mut config = EngineConfig::default();
        config
            .apply_env(|var| match var {
                GOVERNANCE_URL_VAR => Some("http://metagov:8000".into()),
                GOVERNANCE_TIMEOUT_VAR => Some("1500".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.governance.base_url.as_deref(), Some("http://metagov:8000"));
        assert_eq!(config.governance.timeout_ms, 1500);
    }

    #[test]
    fn malformed_timeout_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|var| (var == GOVERNANCE_TIMEOUT_VAR).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: GOVERNANCE_TIMEOUT_VAR, .. }));
    }

    #[test]
    fn unknown_types_fail_to_parse() {
        assert!(matches!(
            EngineConfig::from_toml_str("[scheduler]\ninterval_secs = \"often\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
