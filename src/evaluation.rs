use std::sync::Arc;

use z3::{
    ast::{Ast, Bool, BV},
    Context,
};

use crate::{
    bytecode::Instruction,
    dynamic::{step, ControlTransfer, Effects},
    error::SynthError,
    state::{Generation, State},
    traits::ModelingContext,
    ty::{ArchInfo, ADDRESS_BITS},
    value::ResolvedVarNode,
};

/// A lifted instruction sequence: pre-state, post-state and exit.
///
/// Models both library gadgets and reference slots.
#[derive(Clone, Debug)]
pub struct ModeledBlock<'ctx> {
    instructions: Vec<Instruction>,
    original_state: State<'ctx>,
    final_state: State<'ctx>,
    inputs: Vec<ResolvedVarNode<'ctx>>,
    outputs: Vec<ResolvedVarNode<'ctx>>,
    transfer: Option<ControlTransfer<'ctx>>,
    user_ops: Vec<String>,
}

impl<'ctx> ModeledBlock<'ctx> {
    /// Symbolically execute `instructions` from a fresh state of `generation`.
    pub fn read(
        ctx: &'ctx Context,
        arch: &Arc<ArchInfo>,
        instructions: Vec<Instruction>,
        generation: Generation,
    ) -> Result<Self, SynthError> {
        if instructions.is_empty() {
            return Err(SynthError::EmptySpecification);
        }
        let original_state = State::new(ctx, arch, generation);
        let mut state = original_state.clone();
        let mut effects = Effects::new();
        'outer: for instruction in &instructions {
            let fallthrough = instruction.address + instruction.length as u64;
            for op in &instruction.ops {
                state = step(&state, op, fallthrough, &mut effects)?;
                if effects.transfer.is_some() {
                    break 'outer;
                }
            }
        }
        Ok(Self {
            instructions,
            original_state,
            final_state: state,
            inputs: effects.inputs,
            outputs: effects.outputs,
            transfer: effects.transfer,
            user_ops: effects.user_ops,
        })
    }

    pub fn get_ctx(&self) -> &'ctx Context {
        self.original_state.get_ctx()
    }

    pub fn address(&self) -> u64 {
        self.instructions[0].address
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn transfer(&self) -> Option<&ControlTransfer<'ctx>> {
        self.transfer.as_ref()
    }

    pub fn user_ops(&self) -> &[String] {
        &self.user_ops
    }

    pub fn original_state(&self) -> &State<'ctx> {
        &self.original_state
    }

    pub fn final_state(&self) -> &State<'ctx> {
        &self.final_state
    }

    pub fn inputs(&self) -> &[ResolvedVarNode<'ctx>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ResolvedVarNode<'ctx>] {
        &self.outputs
    }

    /// Can the block exit to the concrete `address`?
    ///
    /// `None` when the block has no control transfer.
    pub fn can_branch_to_address(&self, address: u64) -> Option<Bool<'ctx>> {
        self.transfer
            .as_ref()
            .map(|t| t.target._eq(&BV::from_u64(self.get_ctx(), address, ADDRESS_BITS)))
    }

    /// Does `self` exit to wherever `slot` exits?
    ///
    /// Slots without a control transfer, or with a user operation as their
    /// final effect, impose nothing.
    pub fn branch_comparison(&self, slot: &ModeledBlock<'ctx>) -> Option<Bool<'ctx>> {
        let wanted = slot.transfer.as_ref()?;
        let mine = self.transfer.as_ref()?;
        Some(mine.target._eq(&wanted.target))
    }

    /// The post-state of `self` is the pre-state of `next`.
    pub fn assert_concat(&self, next: &ModeledBlock<'ctx>) -> Bool<'ctx> {
        self.final_state.equals(&next.original_state)
    }

    /// `self` produces the same values as `slot` wherever `slot` writes,
    /// except don't-care locations.
    pub fn upholds_postcondition(&self, slot: &ModeledBlock<'ctx>) -> Result<Bool<'ctx>, SynthError> {
        let arch = self.original_state.arch();
        let mut equalities = Vec::new();
        for output in &slot.outputs {
            if let ResolvedVarNode::Direct(vn) = output {
                if arch.is_dont_care(vn) {
                    continue;
                }
            }
            let mine = self.final_state.read_resolved(output)?;
            let wanted = slot.final_state.read_resolved(output)?;
            equalities.push(mine._eq(&wanted));
        }
        Ok(Bool::and(self.get_ctx(), &equalities.iter().collect::<Vec<_>>()))
    }

    /// `self` starts from the same values `slot` reads, so it cannot match
    /// by assuming different inputs.
    pub fn links_inputs(&self, slot: &ModeledBlock<'ctx>) -> Result<Bool<'ctx>, SynthError> {
        let arch = self.original_state.arch();
        let mut equalities = Vec::new();
        for input in &slot.inputs {
            if let ResolvedVarNode::Direct(vn) = input {
                if arch.stack_pointer().covers(vn) || arch.program_counter().covers(vn) {
                    continue;
                }
            }
            let mine = self.original_state.read_resolved(input)?;
            let wanted = slot.original_state.read_resolved(input)?;
            equalities.push(mine._eq(&wanted));
        }
        Ok(Bool::and(self.get_ctx(), &equalities.iter().collect::<Vec<_>>()))
    }

    /// Everything `self` must satisfy to stand in for `slot`.
    pub fn realizes(&self, slot: &ModeledBlock<'ctx>) -> Result<Bool<'ctx>, SynthError> {
        let mut parts = vec![self.links_inputs(slot)?, self.upholds_postcondition(slot)?];
        if let Some(branch) = self.branch_comparison(slot) {
            parts.push(branch);
        }
        Ok(Bool::and(self.get_ctx(), &parts.iter().collect::<Vec<_>>()))
    }
}

impl<'ctx> ModelingContext<'ctx> for ModeledBlock<'ctx> {
    fn get_original_state(&self) -> Option<&State<'ctx>> {
        Some(&self.original_state)
    }

    fn get_final_state(&self) -> Option<&State<'ctx>> {
        Some(&self.final_state)
    }

    fn get_inputs(&self) -> Vec<&ResolvedVarNode<'ctx>> {
        self.inputs.iter().collect()
    }

    fn get_outputs(&self) -> Vec<&ResolvedVarNode<'ctx>> {
        self.outputs.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        semantics::{x86::X86_64Semantics, InstructionSemantics},
        state::StateArena,
    };
    use z3::{Config, SatResult, Solver};

    fn block<'ctx>(
        ctx: &'ctx Context,
        sem: &X86_64Semantics,
        bytes: &[u8],
        address: u64,
        arena: &mut StateArena,
    ) -> ModeledBlock<'ctx> {
        let instructions = sem.decode_block(bytes, address, 4).unwrap();
        ModeledBlock::read(ctx, sem.arch(), instructions, arena.fresh()).unwrap()
    }

    #[test]
    fn relifting_is_state_equal() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let bytes = [0x5f, 0x5e, 0xc3];
        let generation = StateArena::new().fresh();
        let a = ModeledBlock::read(&ctx, sem.arch(), sem.decode_block(&bytes, 0x10, 4).unwrap(), generation).unwrap();
        let b = ModeledBlock::read(&ctx, sem.arch(), sem.decode_block(&bytes, 0x10, 4).unwrap(), generation).unwrap();
        assert_eq!(a.final_state.equals(&b.final_state).simplify().as_bool(), Some(true));
        assert_eq!(a.transfer().unwrap().target, b.transfer().unwrap().target);
    }

    #[test]
    fn pop_realizes_constant_load_when_stack_agrees() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let mut arena = StateArena::new();
        // mov rdi, 0x10 ; ret
        let slot = block(&ctx, &sem, &[0x48, 0xc7, 0xc7, 0x10, 0, 0, 0], 0, &mut arena);
        // pop rdi ; ret
        let gadget = block(&ctx, &sem, &[0x5f, 0xc3], 0x1000, &mut arena);
        let solver = Solver::new(&ctx);
        solver.assert(&gadget.upholds_postcondition(&slot).unwrap());
        assert_eq!(solver.check(), SatResult::Sat);
        // xor edi, edi ; ret
        let zero = block(&ctx, &sem, &[0x31, 0xff, 0xc3], 0x2000, &mut arena);
        solver.reset();
        solver.assert(&zero.upholds_postcondition(&slot).unwrap());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn return_target_comes_from_stack() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let mut arena = StateArena::new();
        let gadget = block(&ctx, &sem, &[0xc3], 0x1000, &mut arena);
        let solver = Solver::new(&ctx);
        let rsp = gadget.original_state.register("RSP").unwrap();
        solver.assert(&rsp._eq(&BV::from_u64(&ctx, 0x8000, 64)));
        solver.assert(&gadget.original_state.memory(0x8000, 8).unwrap()._eq(&BV::from_u64(&ctx, 0x4242, 64)));
        solver.assert(&gadget.can_branch_to_address(0x4242).unwrap().not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }
}
