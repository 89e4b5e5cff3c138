//! Predicates attached to every gadget of a chain.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use z3::ast::{Ast, Bool, BV};

use crate::{
    constraint::{conjoin, disjoin, TransitionConstraintGenerator},
    error::SynthError,
    evaluation::ModeledBlock,
    traits::ModelingContext,
    ty::ADDRESS_BITS,
    value::{resize, ResolvedVarNode},
};

/// An inclusive address range `[min, max]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRange {
    pub min: u64,
    pub max: u64,
}

impl PointerRange {
    /// Every byte of the `size`-byte access at `pointer` lies in the range.
    pub fn contains<'a>(&self, pointer: &BV<'a>, size: usize) -> Bool<'a> {
        let ctx = pointer.get_ctx();
        let span = size.max(1) as u64 - 1;
        if self.max < self.min || self.max - self.min < span {
            return Bool::from_bool(ctx, false);
        }
        let pointer = resize(pointer, ADDRESS_BITS);
        let low = BV::from_u64(ctx, self.min, ADDRESS_BITS);
        let high = BV::from_u64(ctx, self.max - span, ADDRESS_BITS);
        pointer.bvuge(&low) & pointer.bvule(&high)
    }

    /// Concrete version of [`PointerRange::contains`].
    pub fn contains_concrete(&self, address: u64, size: usize) -> bool {
        let span = size.max(1) as u64 - 1;
        address >= self.min && address.checked_add(span).map_or(false, |end| end <= self.max)
    }
}

/// Pointer-range restrictions and custom predicates, applied to each gadget.
#[derive(Clone, Default)]
pub struct TransitionConstraintSet {
    read: Option<Vec<PointerRange>>,
    write: Option<Vec<PointerRange>>,
    custom: Vec<Arc<TransitionConstraintGenerator>>,
}

impl fmt::Debug for TransitionConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionConstraintSet")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("custom", &self.custom.len())
            .finish()
    }
}

impl TransitionConstraintSet {
    pub fn new(read: Option<Vec<PointerRange>>, write: Option<Vec<PointerRange>>) -> Self {
        Self { read, write, custom: Vec::new() }
    }

    pub fn add_custom(&mut self, generator: Arc<TransitionConstraintGenerator>) {
        self.custom.push(generator);
    }

    pub fn read_ranges(&self) -> Option<&[PointerRange]> {
        self.read.as_deref()
    }

    pub fn write_ranges(&self) -> Option<&[PointerRange]> {
        self.write.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.custom.is_empty()
    }

    /// The conjunction of every restriction, evaluated on `block`.
    pub fn apply<'a>(&self, block: &ModeledBlock<'a>) -> Result<Bool<'a>, SynthError> {
        let ctx = block.get_ctx();
        let mut parts = Vec::new();
        if let Some(ranges) = &self.read {
            for input in block.get_inputs() {
                if let Some(c) = within(block, input, ranges) {
                    parts.push(c);
                }
            }
        }
        if let Some(ranges) = &self.write {
            for output in block.get_outputs() {
                if let Some(c) = within(block, output, ranges) {
                    parts.push(c);
                }
            }
        }
        for generator in &self.custom {
            if let Some(c) = generator(block)? {
                parts.push(c);
            }
        }
        Ok(conjoin(ctx, &parts))
    }
}

// Ranges only concern ram; register and scratch accesses are unrestricted.
fn within<'a>(block: &ModeledBlock<'a>, location: &ResolvedVarNode<'a>, ranges: &[PointerRange]) -> Option<Bool<'a>> {
    let ctx = block.get_ctx();
    let ram = block.get_original_state()?.arch().ram_space();
    if location.space() != ram {
        return None;
    }
    match location {
        ResolvedVarNode::Direct(vn) => {
            let inside = ranges.iter().any(|r| r.contains_concrete(vn.offset, vn.size));
            Some(Bool::from_bool(ctx, inside))
        }
        ResolvedVarNode::Indirect(ind) => {
            let inside: Vec<_> = ranges.iter().map(|r| r.contains(&ind.pointer, ind.access_size)).collect();
            Some(disjoin(ctx, &inside))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constraint::{sat, transition_predicate},
        semantics::{x86::X86_64Semantics, InstructionSemantics},
        state::StateArena,
    };
    use z3::{Config, Context, SatResult, Solver};

    #[test]
    fn range_too_small_for_access_is_empty() {
        let ctx = Context::new(&Config::new());
        let p = BV::new_const(&ctx, "p", 64);
        assert!(!sat(&PointerRange { min: 0x10, max: 0x12 }.contains(&p, 4)));
        assert!(sat(&PointerRange { min: 0x10, max: 0x13 }.contains(&p, 4)));
        assert!(PointerRange { min: 0x10, max: 0x13 }.contains_concrete(0x10, 4));
        assert!(!PointerRange { min: 0x10, max: 0x13 }.contains_concrete(0x11, 4));
    }

    #[test]
    fn write_ranges_restrict_stores() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        // mov [rdi], rax ; ret
        let instructions = sem.decode_block(&[0x48, 0x89, 0x07, 0xc3], 0x1000, 4).unwrap();
        let block = ModeledBlock::read(&ctx, sem.arch(), instructions, StateArena::new().fresh()).unwrap();
        let set = TransitionConstraintSet::new(None, Some(vec![PointerRange { min: 0x8000, max: 0x8fff }]));
        let solver = Solver::new(&ctx);
        solver.assert(&set.apply(&block).unwrap());
        let rdi = block.get_original_state().unwrap().register("RDI").unwrap();
        solver.push();
        solver.assert(&rdi._eq(&BV::from_u64(&ctx, 0x8ff8, 64)));
        assert_eq!(solver.check(), SatResult::Sat);
        solver.pop(1);
        solver.assert(&rdi._eq(&BV::from_u64(&ctx, 0x8ff9, 64)));
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn custom_transition_predicates_are_conjoined() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let instructions = sem.decode_block(&[0xc3], 0x1000, 4).unwrap();
        let block = ModeledBlock::read(&ctx, sem.arch(), instructions, StateArena::new().fresh()).unwrap();
        let mut set = TransitionConstraintSet::default();
        assert!(set.is_empty());
        set.add_custom(transition_predicate(|block| Ok(Some(Bool::from_bool(block.get_ctx(), false)))));
        set.add_custom(transition_predicate(|_| Ok(None)));
        assert!(!sat(&set.apply(&block).unwrap()));
    }
}
