use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{error::SynthError, reference::ReferenceProgram, semantics::InstructionSemantics};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BinaryFileSpecification {
    pub path: String,
    pub max_instructions: usize,
    pub base_address: Option<u64>,
    #[serde(default = "default_entry")]
    pub entry: String,
}

fn default_entry() -> String {
    "_start".to_string()
}

impl BinaryFileSpecification {
    pub fn new(path: impl Into<String>, max_instructions: usize) -> Self {
        Self { path: path.into(), max_instructions, base_address: None, entry: default_entry() }
    }
}

/// Where the reference program comes from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SpecificationConfig {
    BinaryFile(BinaryFileSpecification),
    RawPcode(String),
}

impl SpecificationConfig {
    pub fn compile(&self, semantics: &Arc<dyn InstructionSemantics>) -> Result<ReferenceProgram, SynthError> {
        match self {
            SpecificationConfig::BinaryFile(spec) => ReferenceProgram::from_binary(spec, semantics),
            SpecificationConfig::RawPcode(text) => ReferenceProgram::from_pcode(text, semantics.arch()),
        }
    }
}
