use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, synthesis::builder::SynthesisSelectionStrategy};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub strategy: SynthesisSelectionStrategy,
    pub max_candidates_per_slot: usize,
    pub parallel: usize,
    pub combine_instructions: bool,
    /// Solver budget per slot layout; unbounded when absent.
    pub timeout_ms: Option<u64>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        SynthesisConfig {
            strategy: SynthesisSelectionStrategy::Optimize,
            max_candidates_per_slot: 50,
            parallel: 4,
            combine_instructions: true,
            timeout_ms: None,
        }
    }
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_candidates_per_slot == 0 {
            return Err(ConfigError::Invalid {
                field: "synthesis.max_candidates_per_slot",
                reason: "must be positive".into(),
            });
        }
        if self.parallel == 0 {
            return Err(ConfigError::Invalid { field: "synthesis.parallel", reason: "must be positive".into() });
        }
        Ok(())
    }
}
