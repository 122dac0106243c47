//! Engine configuration.
//!
//! A single [`EngineConfig`] is built by the caller (or loaded from TOML) and
//! handed to the [`RunController`](crate::controller::RunController). Each
//! component owns its own section type; this module only aggregates them and
//! checks cross-field consistency.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetConfig, CostModel};
use crate::checkpoint::CheckpointConfig;
use crate::convergence::ConvergenceConfig;
use crate::debate::DebateConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::LockConfig;
use crate::retry::RetryPolicy;
use crate::synthesis::SynthesisConfig;

/// One reviewer category and the criteria it scores.
///
/// The fan-out issues one evaluate call per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub name: String,
    pub criteria: Vec<String>,
}

impl CategorySpec {
    pub fn new(name: impl Into<String>, criteria: &[&str]) -> Self {
        Self {
            name: name.into(),
            criteria: criteria.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// A category that scores a single criterion of the same name.
    pub fn single(name: &str) -> Self {
        Self::new(name, &[name])
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    pub cost: CostModel,
    pub retry: RetryPolicy,
    pub lock: LockConfig,
    pub checkpoint: CheckpointConfig,
    pub debate: DebateConfig,
    pub convergence: ConvergenceConfig,
    pub synthesis: SynthesisConfig,
    pub categories: Vec<CategorySpec>,
    /// How many times a failed run may go back to `PENDING`.
    pub max_run_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            cost: CostModel::default(),
            retry: RetryPolicy::default(),
            lock: LockConfig::default(),
            checkpoint: CheckpointConfig::default(),
            debate: DebateConfig::default(),
            convergence: ConvergenceConfig::default(),
            synthesis: SynthesisConfig::default(),
            categories: ["feasibility", "novelty", "impact", "risk", "cost", "clarity"]
                .iter()
                .map(|name| CategorySpec::single(name))
                .collect(),
            max_run_retries: 2,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing sections take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("Failed to parse engine config TOML")?;
        config
            .validate()
            .context("Engine config failed validation")?;
        Ok(config)
    }

    /// Load the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Every criterion name, in category order.
    pub fn criteria(&self) -> Vec<&str> {
        self.categories
            .iter()
            .flat_map(|c| c.criteria.iter().map(String::as_str))
            .collect()
    }

    /// The category that owns `criterion`.
    pub fn category_of(&self, criterion: &str) -> Option<&CategorySpec> {
        self.categories
            .iter()
            .find(|c| c.criteria.iter().any(|name| name == criterion))
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> EngineResult<()> {
        if self.categories.is_empty() {
            return Err(EngineError::config("at least one category is required"));
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.criteria.is_empty() {
                return Err(EngineError::config(format!(
                    "category '{}' has no criteria",
                    category.name
                )));
            }
            for criterion in &category.criteria {
                if !seen.insert(criterion.as_str()) {
                    return Err(EngineError::config(format!(
                        "criterion '{}' appears in more than one category",
                        criterion
                    )));
                }
            }
        }
        if self.budget.ceiling <= 0.0 || !self.budget.ceiling.is_finite() {
            return Err(EngineError::config("budget ceiling must be positive"));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(EngineError::config("call_timeout_ms must be non-zero"));
        }
        if self.debate.max_in_flight == 0 {
            return Err(EngineError::config("max_in_flight must be non-zero"));
        }
        if self.debate.challengers.is_empty() {
            return Err(EngineError::config("at least one challenger is required"));
        }
        if self.debate.max_delta <= 0.0 {
            return Err(EngineError::config("max_delta must be positive"));
        }
        if self.convergence.stability_window == 0 {
            return Err(EngineError::config("stability_window must be non-zero"));
        }
        for (name, value) in [
            ("min_confidence", self.convergence.min_confidence),
            ("defended_ratio", self.convergence.defended_ratio),
            ("unresolved_penalty", self.synthesis.unresolved_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::config(format!(
                    "{} must be within 0..=1 (got {})",
                    name, value
                )));
            }
        }
        Ok(())
    }
}
