use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    constraint::{MemoryEqualityConstraint, PointerRange, StateConstraint, StateConstraintSet, TransitionConstraintSet},
    error::SynthError,
    ty::ArchInfo,
};

/// Declarative equalities attached to one end of the chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StateEqualityConstraint {
    pub register: Option<BTreeMap<String, i64>>,
    /// Register name to the string it must point at.
    pub pointer: Option<BTreeMap<String, String>>,
    pub memory: Option<Vec<MemoryEqualityConstraint>>,
}

impl StateEqualityConstraint {
    pub fn constraints(&self) -> impl Iterator<Item = StateConstraint> + '_ {
        let registers = self
            .register
            .iter()
            .flatten()
            .map(|(name, value)| StateConstraint::Register { name: name.clone(), value: *value });
        let memory = self.memory.iter().flatten().cloned().map(StateConstraint::Memory);
        let strings = self
            .pointer
            .iter()
            .flatten()
            .map(|(name, value)| StateConstraint::RegisterString { name: name.clone(), value: value.clone() });
        registers.chain(memory).chain(strings)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PointerRangeConstraints {
    pub read: Option<Vec<PointerRange>>,
    pub write: Option<Vec<PointerRange>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConstraintConfig {
    pub precondition: Option<StateEqualityConstraint>,
    pub postcondition: Option<StateEqualityConstraint>,
    #[serde(alias = "transition")]
    pub pointer: Option<PointerRangeConstraints>,
}

/// Constraint sets ready to be applied.
#[derive(Clone, Debug, Default)]
pub struct CompiledConstraints {
    pub precondition: StateConstraintSet,
    pub postcondition: StateConstraintSet,
    pub transition: TransitionConstraintSet,
}

impl ConstraintConfig {
    pub fn compile(&self, arch: &ArchInfo) -> Result<CompiledConstraints, SynthError> {
        let compile_state = |c: &Option<StateEqualityConstraint>| -> Result<StateConstraintSet, SynthError> {
            let mut set = StateConstraintSet::compile(c.iter().flat_map(|c| c.constraints()), arch)?;
            if let Some(ranges) = self.pointer.as_ref().and_then(|p| p.write.as_ref()) {
                set.restrict_placement(ranges);
            }
            Ok(set)
        };
        let pointer = self.pointer.clone().unwrap_or_default();
        Ok(CompiledConstraints {
            precondition: compile_state(&self.precondition)?,
            postcondition: compile_state(&self.postcondition)?,
            transition: TransitionConstraintSet::new(pointer.read, pointer.write),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantics::{x86::X86_64Semantics, InstructionSemantics};

    #[test]
    fn tables_parse_and_compile() {
        let text = r#"
            [precondition.register]
            rax = 0

            [[precondition.memory]]
            space = "ram"
            address = 4096
            size = 8
            value = 0

            [[precondition.memory]]
            space = "ram"
            address = 4096
            size = 8
            value = 1

            [postcondition.register]
            RAX = 59
            rsi = 0

            [postcondition.pointer]
            rdi = "/bin/sh"

            [transition]
            write = [{ min = 0x5000, max = 0x6000 }]
        "#;
        let config: ConstraintConfig = toml::from_str(text).unwrap();
        let pointer = config.pointer.as_ref().unwrap();
        assert!(pointer.read.is_none());
        assert_eq!(pointer.write.as_deref(), Some(&[PointerRange { min: 0x5000, max: 0x6000 }][..]));

        let sem = X86_64Semantics::new();
        let compiled = config.compile(sem.arch()).unwrap();
        assert_eq!(compiled.precondition.memory().map(|m| m.value), Some(0));
        assert_eq!(compiled.precondition.warnings().len(), 1);
        assert_eq!(compiled.postcondition.register_value("rax", sem.arch()), Some(59));
        assert!(compiled.postcondition.warnings().is_empty());
        assert!(compiled.transition.write_ranges().is_some());
    }

    #[test]
    fn missing_sections_compile_to_nothing() {
        let sem = X86_64Semantics::new();
        let compiled = ConstraintConfig::default().compile(sem.arch()).unwrap();
        assert!(compiled.precondition.is_empty());
        assert!(compiled.postcondition.is_empty());
        assert!(compiled.transition.is_empty());
    }
}
