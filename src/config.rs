//! Engine configuration
//!
//! [`EngineConfig`] selects how strictly the engine enforces placement and
//! dependency discipline, and carries the [`CostModel`] used for the
//! informational cycle tally. Configurations can be built in code or loaded
//! from a JSON document.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

// ============================================================================
// Cost model
// ============================================================================

/// Throughput figures for the simulated cycle tally
///
/// The tally never affects results; it only lets schedules be compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Floats moved between GpuHbm and SharedMemory per cycle
    pub hbm_floats_per_cycle: f64,
    /// Floating-point operations retired per cycle
    pub flops_per_cycle: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            hbm_floats_per_cycle: 16.0,
            flops_per_cycle: 256.0,
        }
    }
}

impl CostModel {
    /// Cycles charged for moving `floats` values across tiers
    #[must_use]
    pub fn transfer_cycles(&self, floats: u64) -> f64 {
        floats as f64 / self.hbm_floats_per_cycle
    }

    /// Cycles charged for `flops` floating-point operations
    #[must_use]
    pub fn compute_cycles(&self, flops: u64) -> f64 {
        flops as f64 / self.flops_per_cycle
    }

    fn validate(&self) -> Result<()> {
        if !(self.hbm_floats_per_cycle.is_finite() && self.hbm_floats_per_cycle > 0.0) {
            return Err(SimError::InvalidConfiguration(format!(
                "hbm_floats_per_cycle must be positive, got {}",
                self.hbm_floats_per_cycle
            )));
        }
        if !(self.flops_per_cycle.is_finite() && self.flops_per_cycle > 0.0) {
            return Err(SimError::InvalidConfiguration(format!(
                "flops_per_cycle must be positive, got {}",
                self.flops_per_cycle
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Configuration for [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Require compute operands on-chip and data-movement operands in their target tier
    pub strict_placement: bool,
    /// Reject operations whose inputs have no producer, or whose output already has one
    pub validate_dependencies: bool,
    /// Cost model for the cycle tally
    pub cost: CostModel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_placement: true,
            validate_dependencies: true,
            cost: CostModel::default(),
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable placement enforcement
    #[must_use]
    pub fn with_strict_placement(mut self, strict: bool) -> Self {
        self.strict_placement = strict;
        self
    }

    /// Enable/disable enqueue-time dependency validation
    #[must_use]
    pub fn with_validate_dependencies(mut self, validate: bool) -> Self {
        self.validate_dependencies = validate;
        self
    }

    /// Set the cost model
    #[must_use]
    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for non-positive throughput figures.
    pub fn validate(&self) -> Result<()> {
        self.cost.validate()
    }

    /// Parse and validate a JSON configuration document
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` on malformed JSON and `InvalidConfiguration` on bad values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read, otherwise as [`EngineConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}
