use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    semantics::{semantics_for, x86::LANGUAGE_ID, InstructionSemantics},
};

/// Which instruction semantics to lift with.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SleighConfig {
    #[serde(default = "default_language")]
    pub language_id: String,
}

fn default_language() -> String {
    LANGUAGE_ID.to_string()
}

impl Default for SleighConfig {
    fn default() -> Self {
        Self { language_id: default_language() }
    }
}

impl SleighConfig {
    pub fn semantics(&self) -> Result<Arc<dyn InstructionSemantics>, ConfigError> {
        semantics_for(&self.language_id)
    }
}
