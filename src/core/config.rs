//! Orchestrator configuration.
//!
//! Loaded from `.phasegate/config.toml`. A missing file means defaults, not an
//! error. `PHASEGATE_MAX_CONCURRENCY` and `PHASEGATE_GUARD_TIMEOUT_SECS`
//! override the file.

use crate::core::error::PhasegateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const ENV_MAX_CONCURRENCY: &str = "PHASEGATE_MAX_CONCURRENCY";
pub const ENV_GUARD_TIMEOUT: &str = "PHASEGATE_GUARD_TIMEOUT_SECS";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub guards: GuardConfig,
    pub gate: GateConfig,
    /// Command-backed executors keyed by capability tag.
    pub executors: BTreeMap<String, ExecutorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Plan manifest path, relative to the project root.
    pub plan: String,
    /// Task card directory, relative to the project root.
    pub cards_dir: String,
    /// Upper bound on workflows executing at once.
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            plan: "phasegate.toml".to_string(),
            cards_dir: "cards".to_string(),
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Applied to guards and acceptance commands that declare no timeout.
    pub default_timeout_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
        }
    }
}

/// What happens to a soft item whose deadline phase passed unresolved.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationPolicy {
    /// Reported as OVERDUE for human review; the verdict is unaffected.
    #[default]
    ManualSignoff,
    /// OVERDUE items become blocking items.
    HardBlock,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GateConfig {
    pub escalation: EscalationPolicy,
    /// Treat unbound cross-layer nodes as blocking.
    pub unbound_nodes_block: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self, PhasegateError> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path).map_err(PhasegateError::IoError)?;
            toml::from_str::<Config>(&content).map_err(|e| {
                PhasegateError::ConfigError(format!("{}: {}", config_path.display(), e))
            })?
        } else {
            Config::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), PhasegateError> {
        if let Ok(raw) = std::env::var(ENV_MAX_CONCURRENCY) {
            self.orchestrator.max_concurrency = raw.trim().parse().map_err(|_| {
                PhasegateError::ConfigError(format!("{ENV_MAX_CONCURRENCY} must be an integer"))
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_GUARD_TIMEOUT) {
            self.guards.default_timeout_secs = raw.trim().parse().map_err(|_| {
                PhasegateError::ConfigError(format!("{ENV_GUARD_TIMEOUT} must be an integer"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PhasegateError> {
        if self.orchestrator.max_concurrency == 0 {
            return Err(PhasegateError::ConfigError(
                "orchestrator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.guards.default_timeout_secs == 0 {
            return Err(PhasegateError::ConfigError(
                "guards.default_timeout_secs must be at least 1".to_string(),
            ));
        }
        for (capability, exec) in &self.executors {
            if exec.command.trim().is_empty() {
                return Err(PhasegateError::ConfigError(format!(
                    "executors.{capability}.command is empty"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
[orchestrator]
max_concurrency = 2

[gate]
escalation = "hard-block"
unbound_nodes_block = true

[executors.implementation]
command = "./run-agent.sh"
args = ["--card"]
timeout_secs = 900
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.orchestrator.max_concurrency, 2);
        assert_eq!(config.orchestrator.plan, "phasegate.toml");
        assert_eq!(config.gate.escalation, EscalationPolicy::HardBlock);
        assert!(config.gate.unbound_nodes_block);
        assert_eq!(config.executors["implementation"].timeout_secs, Some(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.gate.escalation, EscalationPolicy::ManualSignoff);
        assert!(!config.gate.unbound_nodes_block);
        assert_eq!(config.guards.default_timeout_secs, 300);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.orchestrator.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(PhasegateError::ConfigError(_))
        ));
    }
}
