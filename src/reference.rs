//! The program a chain has to reproduce.

use std::sync::Arc;

use tracing::{event, instrument, Level};
use z3::{
    ast::{Ast, BV},
    Config, Context, SatResult, Solver,
};

use crate::{
    bytecode::{text::parse_program, Instruction},
    config::specification::BinaryFileSpecification,
    error::SynthError,
    evaluation::ModeledBlock,
    loader::Image,
    semantics::InstructionSemantics,
    state::StateArena,
    traits::ModelingContext,
    ty::ArchInfo,
    value::ResolvedVarNode,
};

pub mod partition;
pub mod valuation;

pub use partition::{Partition, PartitionIterator};
pub use valuation::MemoryValuation;

// Pointers loaded from pinned memory can reveal further pinned memory.
const VALUATION_ROUNDS: usize = 8;

/// A straight-line instruction sequence plus the memory it reads from its
/// own image.
#[derive(Debug, Clone)]
pub struct ReferenceProgram {
    instructions: Vec<Instruction>,
    initial_memory: MemoryValuation,
}

impl ReferenceProgram {
    /// Reject empty programs and conditional control flow.
    pub fn new(instructions: Vec<Instruction>) -> Result<Self, SynthError> {
        if instructions.is_empty() {
            return Err(SynthError::EmptySpecification);
        }
        if let Some(branching) = instructions.iter().find(|i| i.has_conditional_branch()) {
            return Err(SynthError::UnsupportedControlFlow { address: branching.address });
        }
        Ok(Self { instructions, initial_memory: MemoryValuation::new() })
    }

    pub fn from_binary(
        spec: &BinaryFileSpecification,
        semantics: &Arc<dyn InstructionSemantics>,
    ) -> Result<Self, SynthError> {
        let mut image = Image::from_file(&spec.path)?;
        if let Some(base) = spec.base_address {
            image.rebase(base);
        }
        Self::from_image(&image, &spec.entry, spec.max_instructions, semantics)
    }

    /// Lift from `entry` until the first control transfer or system call.
    #[instrument(skip_all, fields(image = image.name(), entry = entry))]
    pub fn from_image(
        image: &Image,
        entry: &str,
        max_instructions: usize,
        semantics: &Arc<dyn InstructionSemantics>,
    ) -> Result<Self, SynthError> {
        let address = image.symbol(entry).ok_or_else(|| SynthError::MissingSymbol(entry.to_string()))?;
        let bytes = image.bytes_from(address).ok_or(SynthError::UnmappedAddress(address))?;
        let instructions = lift_straight_line(semantics.as_ref(), bytes, address, max_instructions)?;
        let mut program = Self::new(instructions)?;
        program.initial_memory = initial_valuation(&program.instructions, image, semantics.arch())?;
        event!(
            Level::INFO,
            "reference program has {} instructions, {} pinned memory regions",
            program.instructions.len(),
            program.initial_memory.iter().count()
        );
        Ok(program)
    }

    /// Pre-lifted operations, one instruction per line.
    pub fn from_pcode(text: &str, arch: &ArchInfo) -> Result<Self, SynthError> {
        Self::new(parse_program(text, arch)?)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn initial_memory(&self) -> &MemoryValuation {
        &self.initial_memory
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Candidate slot lists, best first.
    ///
    /// Without `combine` there is exactly one: every instruction is a slot.
    /// Otherwise every contiguous partition is tried, each piece fused into
    /// one slot, fewest slots first.
    pub fn slot_layouts(&self, combine: bool) -> Vec<Vec<Instruction>> {
        if !combine {
            return vec![self.instructions.clone()];
        }
        self.instructions
            .partitions()
            .filter_map(|pieces| pieces.into_iter().map(Instruction::combine).collect::<Option<Vec<_>>>())
            .collect()
    }
}

// A reference program ends with its first control transfer or user op, so
// whatever follows a trailing `syscall` is never decoded.
fn lift_straight_line(
    semantics: &dyn InstructionSemantics,
    bytes: &[u8],
    address: u64,
    max_instructions: usize,
) -> Result<Vec<Instruction>, SynthError> {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while instructions.len() < max_instructions && offset < bytes.len() {
        let instruction = semantics.decode(&bytes[offset..], address + offset as u64)?;
        offset += instruction.length;
        let last = instruction.terminates_block() || instruction.user_ops().next().is_some();
        instructions.push(instruction);
        if last {
            break;
        }
    }
    Ok(instructions)
}

// Concrete value of `pointer`, if the solver admits exactly one.
fn concrete<'ctx>(solver: &Solver<'ctx>, pointer: &BV<'ctx>) -> Option<u64> {
    if let Some(value) = pointer.simplify().as_u64() {
        return Some(value);
    }
    if solver.check() != SatResult::Sat {
        return None;
    }
    let value = solver.get_model()?.eval(pointer, true)?.as_u64()?;
    solver.push();
    solver.assert(&pointer._eq(&BV::from_u64(pointer.get_ctx(), value, pointer.get_size())).not());
    let unique = solver.check() == SatResult::Unsat;
    solver.pop(1);
    unique.then(|| value)
}

fn initial_valuation(
    instructions: &[Instruction],
    image: &Image,
    arch: &Arc<ArchInfo>,
) -> Result<MemoryValuation, SynthError> {
    let ctx = Context::new(&Config::new());
    let block = ModeledBlock::read(&ctx, arch, instructions.to_vec(), StateArena::new().fresh())?;
    let original = block.get_original_state().ok_or(SynthError::EmptySpecification)?;
    let mut valuation = MemoryValuation::new();
    for _ in 0..VALUATION_ROUNDS {
        let solver = Solver::new(&ctx);
        solver.assert(&valuation.apply(original)?);
        let mut grew = false;
        for input in block.get_inputs() {
            if let ResolvedVarNode::Indirect(ind) = input {
                if ind.space != arch.ram_space() {
                    continue;
                }
                let bytes = concrete(&solver, &ind.pointer)
                    .and_then(|address| image.read_bytes(address, ind.access_size).map(|b| (address, b)));
                if let Some((address, bytes)) = bytes {
                    grew |= valuation.insert(address, bytes.to_vec());
                }
            }
        }
        if !grew {
            break;
        }
    }
    Ok(valuation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loader::Segment, semantics::x86::X86_64Semantics};

    fn semantics() -> Arc<dyn InstructionSemantics> {
        Arc::new(X86_64Semantics::new())
    }

    #[test]
    fn lifting_stops_at_the_first_transfer() {
        // mov eax, 0x3b ; xor esi, esi ; ret ; pop rdi
        let image = Image::from_raw("ref", 0x400000, &[0xb8, 0x3b, 0, 0, 0, 0x31, 0xf6, 0xc3, 0x5f]);
        let program = ReferenceProgram::from_image(&image, "_start", 10, &semantics()).unwrap();
        assert_eq!(program.len(), 3);
        assert!(program.initial_memory().is_empty());
    }

    #[test]
    fn lifting_stops_after_a_syscall() {
        // mov eax, 0x3b ; syscall ; hlt
        let image = Image::from_raw("ref", 0x400000, &[0xb8, 0x3b, 0, 0, 0, 0x0f, 0x05, 0xf4]);
        let program = ReferenceProgram::from_image(&image, "_start", 10, &semantics()).unwrap();
        assert_eq!(program.len(), 2);
        assert_eq!(program.instructions()[1].user_ops().count(), 1);
        // an undecodable instruction before the end is still fatal
        let image = Image::from_raw("ref", 0x400000, &[0xb8, 0x3b, 0, 0, 0, 0xf4, 0x0f, 0x05]);
        assert!(matches!(
            ReferenceProgram::from_image(&image, "_start", 10, &semantics()),
            Err(SynthError::Lift(_))
        ));
    }

    #[test]
    fn conditional_branches_are_rejected() {
        // xor eax, eax ; je +0
        let image = Image::from_raw("ref", 0x1000, &[0x31, 0xc0, 0x74, 0x00]);
        assert!(matches!(
            ReferenceProgram::from_image(&image, "_start", 10, &semantics()),
            Err(SynthError::UnsupportedControlFlow { address: 0x1002 })
        ));
    }

    #[test]
    fn missing_entry_symbol() {
        let image = Image::from_raw("ref", 0x1000, &[0xc3]);
        assert!(matches!(
            ReferenceProgram::from_image(&image, "main", 10, &semantics()),
            Err(SynthError::MissingSymbol(_))
        ));
    }

    #[test]
    fn constant_loads_are_pinned() {
        // mov edi, 0x2000 ; mov rax, [rdi] ; mov rsi, [rax]
        let code = [0xbf, 0x00, 0x20, 0, 0, 0x48, 0x8b, 0x07, 0x48, 0x8b, 0x30];
        let mut data = vec![0u8; 0x20];
        data[..8].copy_from_slice(&0x2010u64.to_le_bytes());
        data[0x10..0x18].copy_from_slice(b"/bin/sh\0");
        let image = Image::from_raw("ref", 0x1000, &code).with_segment(Segment {
            base_address: 0x2000,
            data,
            executable: false,
            writable: true,
        });
        let program = ReferenceProgram::from_image(&image, "_start", 3, &semantics()).unwrap();
        let pinned: Vec<_> = program.initial_memory().iter().map(|(a, b)| (*a, b.clone())).collect();
        assert_eq!(pinned, vec![(0x2000, 0x2010u64.to_le_bytes().to_vec()), (0x2010, b"/bin/sh\0".to_vec())]);
    }

    #[test]
    fn layouts_fuse_neighbours() {
        let sem = semantics();
        let program = ReferenceProgram::from_pcode("RAX = COPY 0x3b:8\nRDI = COPY 0x0:8\n", sem.arch()).unwrap();
        assert_eq!(program.slot_layouts(false).len(), 1);
        let layouts = program.slot_layouts(true);
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].len(), 1);
        assert_eq!(layouts[0][0].ops.len(), 2);
        assert_eq!(layouts[1].len(), 2);
    }

    #[test]
    fn empty_program_is_an_error() {
        let sem = semantics();
        assert!(matches!(ReferenceProgram::from_pcode("# nothing\n", sem.arch()), Err(SynthError::EmptySpecification)));
    }
}
