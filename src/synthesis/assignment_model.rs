//! Concrete values read back from a satisfying model.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use itertools::Itertools;
use serde::Serialize;
use z3::{
    ast::{Ast, Bool, BV},
    Model,
};

use crate::{
    bytecode::VarNode,
    constraint::{conjoin, StateConstraintSet},
    error::SynthError,
    evaluation::ModeledBlock,
    gadget::Gadget,
    state::State,
    ty::ADDRESS_BITS,
    value::{resize, ResolvedVarNode},
};

/// A location and the value it must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    Register { name: String, value: u64 },
    Memory { address: u64, bytes: Vec<u8> },
}

impl Binding {
    /// The predicate "`state` holds this binding".
    pub fn pin<'a>(&self, state: &State<'a>) -> Result<Bool<'a>, SynthError> {
        let ctx = state.get_ctx();
        match self {
            Binding::Register { name, value } => {
                let register = state.register(name)?;
                Ok(register._eq(&BV::from_u64(ctx, *value, register.get_size())))
            }
            Binding::Memory { address, bytes } => {
                let mut parts = Vec::with_capacity(bytes.len());
                for (i, byte) in bytes.iter().enumerate() {
                    let stored = state.memory(address.wrapping_add(i as u64), 1)?;
                    parts.push(stored._eq(&BV::from_u64(ctx, *byte as u64, 8)));
                }
                Ok(conjoin(ctx, &parts))
            }
        }
    }
}

impl Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Register { name, value } => write!(f, "{} = {:#x}", name, value),
            Binding::Memory { address, bytes } => {
                write!(f, "[{:#x}] = {}", address, bytes.iter().map(|b| format!("{:02x}", b)).join(""))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStep {
    pub slot: usize,
    pub library: usize,
    pub address: u64,
    /// Instructions in the gadget, for relifting.
    pub length: usize,
    pub disassembly: String,
    /// Everything the gadget reads, as it was on entry.
    pub bindings: Vec<Binding>,
}

impl Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>3}  {}:{:#x}  {}", self.slot, self.library, self.address, self.disassembly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSolution {
    pub steps: Vec<ChainStep>,
    pub initial_registers: BTreeMap<String, u64>,
    pub final_registers: BTreeMap<String, u64>,
    /// Bytes placed for register-string preconditions.
    pub initial_memory: Vec<Binding>,
}

fn eval<'a>(model: &Model<'a>, value: &BV<'a>) -> Result<u64, SynthError> {
    model
        .eval(value, true)
        .and_then(|v| v.simplify().as_u64())
        .ok_or_else(|| SynthError::ModelParsing(value.to_string()))
}

fn eval_bytes<'a>(model: &Model<'a>, state: &State<'a>, address: u64, size: usize) -> Result<Vec<u8>, SynthError> {
    (0..size as u64)
        .map(|i| Ok(eval(model, &state.memory(address.wrapping_add(i), 1)?)? as u8))
        .collect()
}

fn registers<'a>(model: &Model<'a>, state: &State<'a>) -> Result<BTreeMap<String, u64>, SynthError> {
    state
        .arch()
        .primary_registers()
        .map(|r| Ok((r.name.clone(), eval(model, &state.read(&r.varnode)?)?)))
        .collect()
}

fn binding<'a>(model: &Model<'a>, state: &State<'a>, input: &ResolvedVarNode<'a>) -> Result<Option<Binding>, SynthError> {
    let arch = state.arch();
    match input {
        ResolvedVarNode::Direct(vn) if vn.space == arch.register_space() => match arch.register_name(vn) {
            Some(name) => Ok(Some(Binding::Register { name: name.to_string(), value: eval(model, &state.read(vn)?)? })),
            None => Ok(None),
        },
        ResolvedVarNode::Direct(VarNode { space, offset, size }) if *space == arch.ram_space() => {
            Ok(Some(Binding::Memory { address: *offset, bytes: eval_bytes(model, state, *offset, *size)? }))
        }
        ResolvedVarNode::Indirect(ind) if ind.space == arch.ram_space() => {
            let address = eval(model, &resize(&ind.pointer, ADDRESS_BITS))?;
            Ok(Some(Binding::Memory { address, bytes: eval_bytes(model, state, address, ind.access_size)? }))
        }
        _ => Ok(None),
    }
}

impl ChainSolution {
    /// `chain` lists, per slot, the chosen gadget and its model.
    pub fn from_model<'a>(
        model: &Model<'a>,
        chain: &[(&Gadget, &ModeledBlock<'a>)],
        preconditions: &StateConstraintSet,
    ) -> Result<Self, SynthError> {
        let (first, last) = match (chain.first(), chain.last()) {
            (Some(first), Some(last)) => (first.1, last.1),
            _ => return Err(SynthError::EmptySpecification),
        };
        let mut steps = Vec::with_capacity(chain.len());
        for (slot, (gadget, block)) in chain.iter().enumerate() {
            let mut bindings = Vec::new();
            for input in block.inputs() {
                if let Some(b) = binding(model, block.original_state(), input)? {
                    if !bindings.contains(&b) {
                        bindings.push(b);
                    }
                }
            }
            steps.push(ChainStep {
                slot,
                library: gadget.library(),
                address: gadget.address(),
                length: gadget.len(),
                disassembly: gadget.disassembly(),
                bindings,
            });
        }
        let initial_memory = preconditions
            .placements(first.original_state(), model)?
            .into_iter()
            .map(|(address, bytes)| Binding::Memory { address, bytes })
            .collect();
        Ok(Self {
            steps,
            initial_registers: registers(model, first.original_state())?,
            final_registers: registers(model, last.final_state())?,
            initial_memory,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.steps.iter().map(|s| s.address).collect()
    }
}

impl Display for ChainSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.steps.iter().join("\n"))?;
        if !self.initial_memory.is_empty() {
            writeln!(f, "memory: {}", self.initial_memory.iter().join(", "))?;
        }
        Ok(())
    }
}
