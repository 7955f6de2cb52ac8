//! Engine configuration and JSON loader.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! { "voting": { "vote_timeout_ms": 500 }, "dissensus": { "veto_mode": "escalate" } }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dissensus::VetoMode;
use crate::phi::{fibonacci, PHI_INV, PHI_INV_2, PHI_INV_3};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read engine config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse engine config: {0}")]
    Parse(String),
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub voting: VotingConfig,
    pub dissensus: DissensusConfig,
    pub escalation: EscalationConfig,
    pub calibration: CalibrationConfig,
    pub residual: ResidualConfig,
    pub governance: GovernanceConfig,
    pub selection: SelectionConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// SQLite path used by the CLI. Falls back to [`default_store_path`].
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Per-agent vote deadline; late agents abstain.
    pub vote_timeout_ms: u64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DissensusConfig {
    /// Minimum weight share on each side for a split.
    pub split_share: f64,
    /// `|activation|` below this is a deadlock.
    pub deadlock_band: f64,
    pub veto_mode: VetoMode,
    /// Dimensions reported in an escalation's disagreement axis.
    pub disagreement_axis_len: usize,
}

impl Default for DissensusConfig {
    fn default() -> Self {
        Self {
            split_share: 0.30,
            deadlock_band: 0.05,
            veto_mode: VetoMode::Absolute,
            disagreement_axis_len: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub max_rounds: u32,
    /// Cap on reserve agents consulted across all rounds.
    pub max_additional_agents: usize,
    /// When the vote budget runs out, hand the decision to an external
    /// decision-maker instead of failing closed immediately.
    pub defer_external: bool,
    /// Deferred escalations older than this fail closed when the engine is
    /// restored or [`expire_overdue_escalations`] runs. `None` never expires.
    ///
    /// [`expire_overdue_escalations`]: crate::JudgmentEngine::expire_overdue_escalations
    pub external_timeout_ms: Option<u64>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            max_additional_agents: 3,
            defer_external: false,
            external_timeout_ms: Some(86_400_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub ema_alpha: f64,
    pub ece_window: usize,
    pub ece_bins: usize,
    pub ece_min_samples: usize,
    pub ece_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            ece_window: fibonacci(10) as usize,
            ece_bins: 10,
            ece_min_samples: fibonacci(8) as usize,
            ece_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualConfig {
    /// Residuals with smaller magnitude are explained.
    pub threshold: f64,
    /// Significance level for pattern analysis.
    pub alpha: f64,
    pub window: usize,
    pub min_points: usize,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            threshold: PHI_INV_2,
            alpha: 0.05,
            window: fibonacci(8) as usize,
            min_points: fibonacci(4) as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Approval share of eligible voters needed to register a proposal.
    pub approve_quorum: f64,
    /// Weight given to newly approved dimensions.
    pub new_dimension_weight: f64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            approve_quorum: PHI_INV,
            new_dimension_weight: PHI_INV_2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Dimensions scored by the sparse panel agent.
    pub top_k: usize,
    /// Axiom-score spread that widens a sparse selection.
    pub expand_spread: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            expand_spread: PHI_INV_3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts to take a registry snapshot before giving up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive vote failures that open an agent's circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before a trial call.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: fibonacci(5) as u32,
            cooldown_ms: (PHI_INV_2 * 60_000.0).round() as u64,
        }
    }
}

impl RetryConfig {
    /// Exponential delay before retry `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(default_store_path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        let positive = |name: &str, v: usize| {
            if v > 0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be positive")))
            }
        };

        if self.voting.vote_timeout_ms == 0 {
            return Err(ConfigError::Invalid("voting.vote_timeout_ms must be positive".into()));
        }
        unit("dissensus.split_share", self.dissensus.split_share)?;
        unit("dissensus.deadlock_band", self.dissensus.deadlock_band)?;
        unit("calibration.ema_alpha", self.calibration.ema_alpha)?;
        unit("calibration.ece_threshold", self.calibration.ece_threshold)?;
        positive("calibration.ece_window", self.calibration.ece_window)?;
        positive("calibration.ece_bins", self.calibration.ece_bins)?;
        if self.calibration.ece_min_samples > self.calibration.ece_window {
            return Err(ConfigError::Invalid(
                "calibration.ece_min_samples exceeds calibration.ece_window".into(),
            ));
        }
        unit("residual.threshold", self.residual.threshold)?;
        unit("residual.alpha", self.residual.alpha)?;
        positive("residual.window", self.residual.window)?;
        if self.residual.min_points < 2 {
            return Err(ConfigError::Invalid("residual.min_points must be at least 2".into()));
        }
        unit("governance.approve_quorum", self.governance.approve_quorum)?;
        if !(self.governance.new_dimension_weight > 0.0 && self.governance.new_dimension_weight <= 1.0) {
            return Err(ConfigError::Invalid(
                "governance.new_dimension_weight must be in (0, 1]".into(),
            ));
        }
        positive("selection.top_k", self.selection.top_k)?;
        if !self.selection.expand_spread.is_finite() || self.selection.expand_spread < 0.0 {
            return Err(ConfigError::Invalid("selection.expand_spread must be >= 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker.failure_threshold must be positive".into()));
        }
        if self.escalation.external_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "escalation.external_timeout_ms must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

pub fn default_store_path() -> PathBuf {
    if let Ok(path) = std::env::var("JUDGE_STORE_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from(".judgment_engine.sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json(r#"{"voting":{"vote_timeout_ms":50}}"#).unwrap();
        assert_eq!(cfg.voting.vote_timeout_ms, 50);
        assert_eq!(cfg.calibration.ece_window, 55);
        assert_eq!(cfg.residual.window, 21);
        assert_eq!(cfg.dissensus.veto_mode, VetoMode::Absolute);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.cooldown_ms, 22_918);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = EngineConfig::from_json(r#"{"residual":{"alpha":1.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = EngineConfig::from_json(r#"{"voting":"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
        };
        assert_eq!(retry.backoff_delay(0).as_millis(), 10);
        assert_eq!(retry.backoff_delay(3).as_millis(), 80);
    }
}
