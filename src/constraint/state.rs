//! Predicates attached to the first or last state of a chain.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{event, Level};
use z3::{
    ast::{Ast, Bool, BV},
    Model,
};

use crate::{
    bytecode::VarNode,
    constraint::{conjoin, disjoin, transition::PointerRange, StateConstraintGenerator},
    error::{ConfigError, SynthError},
    state::State,
    ty::{ArchInfo, ADDRESS_BITS},
    value::{constant, resize},
};

/// Fill `size` bytes at `address` of `space` with `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEqualityConstraint {
    pub space: String,
    pub address: u64,
    pub size: usize,
    pub value: u8,
}

/// Degradations applied while compiling a constraint set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub enum ConstraintWarning {
    #[error("ignoring memory constraint {dropped:?}; only {kept:?} is honored")]
    ConflictingMemoryConstraint {
        kept: MemoryEqualityConstraint,
        dropped: MemoryEqualityConstraint,
    },
    #[error("register {register} constrained twice; {value:#x} replaces {previous:#x}")]
    DuplicateRegisterConstraint { register: String, previous: i64, value: i64 },
}

/// One state predicate, before compilation.
///
/// Only the declarative variants are data; custom predicates are process-local
/// and refuse to serialize.
#[derive(Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateConstraint {
    Register { name: String, value: i64 },
    Memory(MemoryEqualityConstraint),
    RegisterString { name: String, value: String },
    #[serde(skip_serializing)]
    Custom(Arc<StateConstraintGenerator>),
}

impl fmt::Debug for StateConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateConstraint::Register { name, value } => write!(f, "Register({} = {:#x})", name, value),
            StateConstraint::Memory(m) => write!(f, "Memory({:?})", m),
            StateConstraint::RegisterString { name, value } => write!(f, "RegisterString({} -> {:?})", name, value),
            StateConstraint::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
struct RegisterEquality {
    name: String,
    varnode: VarNode,
    value: i64,
}

#[derive(Debug, Clone)]
struct StringPlacement {
    name: String,
    varnode: VarNode,
    bytes: Vec<u8>,
}

/// Compiled predicates of one attachment point, conjoined on application.
#[derive(Clone, Default)]
pub struct StateConstraintSet {
    registers: Vec<RegisterEquality>,
    memory: Option<MemoryEqualityConstraint>,
    strings: Vec<StringPlacement>,
    placement: Vec<PointerRange>,
    custom: Vec<Arc<StateConstraintGenerator>>,
    warnings: Vec<ConstraintWarning>,
}

impl fmt::Debug for StateConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateConstraintSet")
            .field("registers", &self.registers)
            .field("memory", &self.memory)
            .field("strings", &self.strings)
            .field("custom", &self.custom.len())
            .finish()
    }
}

impl StateConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile<I>(constraints: I, arch: &ArchInfo) -> Result<Self, SynthError>
    where
        I: IntoIterator<Item = StateConstraint>,
    {
        let mut set = Self::new();
        for constraint in constraints {
            set.push(constraint, arch)?;
        }
        Ok(set)
    }

    fn warn(&mut self, warning: ConstraintWarning) {
        event!(Level::WARN, "{}", warning);
        self.warnings.push(warning);
    }

    /// Add one constraint, applying the register last-wins and memory
    /// first-wins policies.
    pub fn push(&mut self, constraint: StateConstraint, arch: &ArchInfo) -> Result<(), SynthError> {
        let lookup = |name: &str| {
            arch.register(name)
                .copied()
                .ok_or_else(|| SynthError::from(ConfigError::UnknownRegister(name.to_string())))
        };
        match constraint {
            StateConstraint::Register { name, value } => {
                let varnode = lookup(&name)?;
                match self.registers.iter().position(|r| r.varnode == varnode) {
                    Some(index) => {
                        let existing = &mut self.registers[index];
                        let warning = ConstraintWarning::DuplicateRegisterConstraint {
                            register: name.clone(),
                            previous: existing.value,
                            value,
                        };
                        existing.value = value;
                        existing.name = name;
                        self.warn(warning);
                    }
                    None => self.registers.push(RegisterEquality { name, varnode, value }),
                }
            }
            StateConstraint::Memory(memory) => {
                if arch.space_by_name(&memory.space).is_none() {
                    return Err(ConfigError::UnknownSpace(memory.space).into());
                }
                match self.memory.clone() {
                    Some(kept) => self.warn(ConstraintWarning::ConflictingMemoryConstraint { kept, dropped: memory }),
                    None => self.memory = Some(memory),
                }
            }
            StateConstraint::RegisterString { name, value } => {
                let varnode = lookup(&name)?;
                let mut bytes = value.into_bytes();
                bytes.push(0);
                self.strings.push(StringPlacement { name, varnode, bytes });
            }
            StateConstraint::Custom(generator) => self.custom.push(generator),
        }
        Ok(())
    }

    pub fn add_custom(&mut self, generator: Arc<StateConstraintGenerator>) {
        self.custom.push(generator);
    }

    /// Restrict string placements to lie inside one of `ranges`.
    pub fn restrict_placement(&mut self, ranges: &[PointerRange]) {
        self.placement = ranges.to_vec();
    }

    pub fn warnings(&self) -> &[ConstraintWarning] {
        &self.warnings
    }

    pub fn memory(&self) -> Option<&MemoryEqualityConstraint> {
        self.memory.as_ref()
    }

    pub fn register_value(&self, name: &str, arch: &ArchInfo) -> Option<i64> {
        let varnode = arch.register(name)?;
        self.registers.iter().find(|r| &r.varnode == varnode).map(|r| r.value)
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.memory.is_none() && self.strings.is_empty() && self.custom.is_empty()
    }

    /// The conjunction of every predicate, evaluated on `state`.
    pub fn apply<'a>(&self, state: &State<'a>, address: u64) -> Result<Bool<'a>, SynthError> {
        let ctx = state.get_ctx();
        let mut parts = Vec::new();
        for register in &self.registers {
            let value = constant(ctx, register.value as u64, register.varnode.size);
            parts.push(state.read(&register.varnode)?._eq(&value));
        }
        if let Some(memory) = &self.memory {
            let space = state
                .arch()
                .space_by_name(&memory.space)
                .ok_or_else(|| ConfigError::UnknownSpace(memory.space.clone()))?;
            for i in 0..memory.size as u64 {
                let byte = state.read(&VarNode::new(space, memory.address + i, 1))?;
                parts.push(byte._eq(&BV::from_u64(ctx, memory.value as u64, 8)));
            }
        }
        for placement in &self.strings {
            parts.push(self.place_string(state, placement)?);
        }
        for generator in &self.custom {
            parts.push(generator(state, address)?);
        }
        Ok(conjoin(ctx, &parts))
    }

    /// Where each register-string landed, as `(address, bytes)`.
    pub fn placements<'a>(&self, state: &State<'a>, model: &Model<'a>) -> Result<Vec<(u64, Vec<u8>)>, SynthError> {
        self.strings
            .iter()
            .map(|placement| {
                let pointer = resize(&state.read(&placement.varnode)?, ADDRESS_BITS);
                let address = model
                    .eval(&pointer, true)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| SynthError::ModelParsing(placement.name.clone()))?;
                Ok((address, placement.bytes.clone()))
            })
            .collect()
    }

    // The register points at the bytes of the string, NUL included.
    fn place_string<'a>(&self, state: &State<'a>, placement: &StringPlacement) -> Result<Bool<'a>, SynthError> {
        let ctx = state.get_ctx();
        let ram = state.arch().ram_space();
        let pointer = state.read(&placement.varnode)?;
        let pointer = resize(&pointer, ADDRESS_BITS);
        let mut parts = Vec::with_capacity(placement.bytes.len() + 1);
        for (i, byte) in placement.bytes.iter().enumerate() {
            let address = pointer.bvadd(&BV::from_u64(ctx, i as u64, ADDRESS_BITS));
            let stored = state.read_indirect(ram, &address, 1)?;
            parts.push(stored._eq(&BV::from_u64(ctx, *byte as u64, 8)));
        }
        if !self.placement.is_empty() {
            let len = placement.bytes.len();
            let inside: Vec<_> = self.placement.iter().map(|r| r.contains(&pointer, len)).collect();
            parts.push(disjoin(ctx, &inside));
        }
        event!(Level::TRACE, "placing {} bytes through {}", placement.bytes.len(), placement.name);
        Ok(conjoin(ctx, &parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        semantics::{x86::X86_64Semantics, InstructionSemantics},
        state::StateArena,
    };
    use z3::{Config, Context, SatResult, Solver};

    fn memset(address: u64, value: u8) -> StateConstraint {
        StateConstraint::Memory(MemoryEqualityConstraint { space: "ram".into(), address, size: 4, value })
    }

    #[test]
    fn first_memory_constraint_wins() {
        let sem = X86_64Semantics::new();
        let set = StateConstraintSet::compile(vec![memset(0x1000, 0x41), memset(0x1000, 0x42)], sem.arch()).unwrap();
        assert_eq!(set.memory().map(|m| m.value), Some(0x41));
        assert!(matches!(set.warnings(), [ConstraintWarning::ConflictingMemoryConstraint { .. }]));

        let ctx = Context::new(&Config::new());
        let state = State::new(&ctx, sem.arch(), StateArena::new().fresh());
        let solver = Solver::new(&ctx);
        solver.assert(&set.apply(&state, 0).unwrap());
        solver.assert(&state.memory(0x1002, 1).unwrap()._eq(&BV::from_u64(&ctx, 0x41, 8)).not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn last_register_constraint_wins() {
        let sem = X86_64Semantics::new();
        let constraints = vec![
            StateConstraint::Register { name: "rax".into(), value: 1 },
            StateConstraint::Register { name: "RAX".into(), value: 2 },
            StateConstraint::Register { name: "rdi".into(), value: 3 },
        ];
        let set = StateConstraintSet::compile(constraints, sem.arch()).unwrap();
        assert_eq!(set.register_value("RAX", sem.arch()), Some(2));
        assert_eq!(set.register_value("RDI", sem.arch()), Some(3));
        assert_eq!(set.warnings().len(), 1);
    }

    #[test]
    fn unknown_register_is_a_configuration_error() {
        let sem = X86_64Semantics::new();
        let result = StateConstraintSet::compile(vec![StateConstraint::Register { name: "xmm0".into(), value: 0 }], sem.arch());
        assert!(matches!(result, Err(SynthError::Config(ConfigError::UnknownRegister(_)))));
    }

    #[test]
    fn string_placement_respects_ranges() {
        let sem = X86_64Semantics::new();
        let ctx = Context::new(&Config::new());
        let state = State::new(&ctx, sem.arch(), StateArena::new().fresh());
        let mut set = StateConstraintSet::compile(
            vec![StateConstraint::RegisterString { name: "RDI".into(), value: "/bin/sh".into() }],
            sem.arch(),
        )
        .unwrap();
        set.restrict_placement(&[PointerRange { min: 0x5000, max: 0x5fff }]);
        let solver = Solver::new(&ctx);
        solver.assert(&set.apply(&state, 0).unwrap());
        assert_eq!(solver.check(), SatResult::Sat);
        let model = solver.get_model().unwrap();
        let rdi = model.eval(&state.register("RDI").unwrap(), true).unwrap().as_u64().unwrap();
        assert!((0x5000..=0x5ff8).contains(&rdi));
        let nul = model.eval(&state.memory(rdi + 7, 1).unwrap(), true).unwrap().as_u64();
        assert_eq!(nul, Some(0));
        assert_eq!(set.placements(&state, &model).unwrap(), vec![(rdi, b"/bin/sh\0".to_vec())]);

        set.restrict_placement(&[PointerRange { min: 0x5000, max: 0x5003 }]);
        solver.reset();
        solver.assert(&set.apply(&state, 0).unwrap());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn custom_predicates_do_not_serialize() {
        let declarative = StateConstraint::Register { name: "RAX".into(), value: 59 };
        assert!(serde_json::to_string(&declarative).unwrap().contains("\"kind\":\"register\""));
        let custom = StateConstraint::Custom(crate::constraint::state_predicate(|state, _| {
            Ok(Bool::from_bool(state.get_ctx(), true))
        }));
        assert!(serde_json::to_string(&custom).is_err());
    }
}
