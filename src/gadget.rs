use std::{
    fmt::{self, Display},
    sync::Arc,
};

use serde::Serialize;
use z3::Context;

use crate::{
    bytecode::{Instruction, PcodeOp},
    error::SynthError,
    evaluation::ModeledBlock,
    state::Generation,
    ty::ArchInfo,
};

pub mod library;
pub mod signature;

pub use library::GadgetLibrary;
pub use signature::GadgetSignature;

/// A usable instruction sequence, identified by `(library, address)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Gadget {
    library: usize,
    instructions: Vec<Instruction>,
}

impl Gadget {
    /// `None` for an empty sequence.
    pub fn new(library: usize, instructions: Vec<Instruction>) -> Option<Self> {
        if instructions.is_empty() {
            None
        } else {
            Some(Self { library, instructions })
        }
    }

    pub fn library(&self) -> usize {
        self.library
    }

    pub fn address(&self) -> u64 {
        self.instructions[0].address
    }

    pub fn id(&self) -> (usize, u64) {
        (self.library, self.address())
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn ops(&self) -> impl Iterator<Item = &PcodeOp> {
        self.instructions.iter().flat_map(|i| i.ops.iter())
    }

    pub fn user_ops(&self) -> impl Iterator<Item = &PcodeOp> {
        self.instructions.iter().flat_map(|i| i.user_ops())
    }

    pub fn signature(&self, arch: &ArchInfo) -> GadgetSignature {
        GadgetSignature::new(&self.instructions, arch)
    }

    pub fn disassembly(&self) -> String {
        self.instructions.iter().map(|i| i.disassembly.to_string()).collect::<Vec<_>>().join("; ")
    }

    pub fn model<'ctx>(
        &self,
        ctx: &'ctx Context,
        arch: &Arc<ArchInfo>,
        generation: Generation,
    ) -> Result<ModeledBlock<'ctx>, SynthError> {
        ModeledBlock::read(ctx, arch, self.instructions.clone(), generation)
    }
}

impl Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for x in &self.instructions {
            writeln!(f, "{:x}\t{}", x.address, x.disassembly)?;
        }
        Ok(())
    }
}
