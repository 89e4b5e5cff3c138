//! A cheap syntactic summary of what a block writes.

use std::{cmp::Ordering, collections::BTreeSet};

use tracing::trace;

use crate::{
    bytecode::{Instruction, PcodeOp, VarNode},
    ty::{ArchInfo, SpaceIndex, SpaceKind},
};

/// Locations written by a block: register and ram varnodes, plus the sizes of
/// its stores through pointers.
#[derive(Clone, Debug, Default)]
pub struct GadgetSignature {
    outputs: Vec<VarNode>,
    stores: Vec<usize>,
}

impl GadgetSignature {
    pub fn new(instructions: &[Instruction], arch: &ArchInfo) -> Self {
        let mut signature = Self::default();
        for op in instructions.iter().flat_map(|i| &i.ops) {
            if let PcodeOp::Store { input, .. } = op {
                signature.stores.push(input.size);
            } else if let Some(output) = op.output() {
                let persistent = arch
                    .space(output.space)
                    .map_or(false, |s| matches!(s.kind, SpaceKind::Register | SpaceKind::Ram));
                if persistent {
                    signature.outputs.push(*output);
                }
            }
        }
        signature
    }

    /// Drop the locations a substitute is free to leave alone.
    pub fn compared(mut self, arch: &ArchInfo) -> Self {
        self.outputs.retain(|vn| !arch.is_dont_care(vn));
        self
    }

    fn bytes(&self) -> BTreeSet<(SpaceIndex, u64)> {
        self.outputs.iter().flat_map(|vn| vn.bytes()).collect()
    }

    /// Does `self` write everything `other` writes?
    ///
    /// Very rough: it only keeps pointless work away from the solver.
    pub fn covers(&self, other: &GadgetSignature) -> bool {
        trace!("{:?} vs {:?}", self, other);
        let mine = self.bytes();
        let direct = other.outputs.iter().flat_map(|vn| vn.bytes()).all(|b| mine.contains(&b));
        let indirect = other.stores.iter().all(|size| self.stores.iter().any(|s| s >= size));
        direct && indirect
    }

    pub fn has_indirect_output(&self) -> bool {
        !self.stores.is_empty()
    }
}

impl PartialEq for GadgetSignature {
    fn eq(&self, other: &GadgetSignature) -> bool {
        self.covers(other) && other.covers(self)
    }
}

impl PartialOrd for GadgetSignature {
    fn partial_cmp(&self, other: &GadgetSignature) -> Option<Ordering> {
        match (self.covers(other), other.covers(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantics::{x86::X86_64Semantics, InstructionSemantics};

    fn direct(outputs: &[(u64, usize)]) -> GadgetSignature {
        GadgetSignature {
            outputs: outputs.iter().map(|&(offset, size)| VarNode::new(0, offset, size)).collect(),
            stores: vec![],
        }
    }

    #[test]
    fn complete_overlap() {
        let o1 = direct(&[(0, 4)]);
        let o2 = direct(&[(0, 4)]);
        assert!(o1.covers(&o2));
        assert!(o2.covers(&o1));
        assert!(o1 >= o2);
        assert!(o1 <= o2);
        assert_eq!(o1, o2);
    }

    #[test]
    fn partial_overlap() {
        let o1 = direct(&[(0, 4)]);
        let o2 = direct(&[(3, 4)]);
        assert_ne!(o1, o2);
        assert!(!o1.covers(&o2));
        assert!(!o2.covers(&o1));
    }

    #[test]
    fn non_overlap() {
        let o1 = direct(&[(0, 4)]);
        let o2 = direct(&[(4, 4)]);
        assert!(!o1.covers(&o2));
        assert!(!o2.covers(&o1));
        assert_eq!(o1.partial_cmp(&o2), None);
    }

    #[test]
    fn different_lengths() {
        let o1 = direct(&[(7, 2)]);
        let o2 = direct(&[(4, 4), (8, 4), (12, 4), (16, 4)]);
        assert!(o2.covers(&o1));
        assert!(!o1.covers(&o2));
        assert!(o2 > o1);
    }

    #[test]
    fn stores_need_stores() {
        let sem = X86_64Semantics::new();
        let arch = sem.arch();
        // mov [rdi], rax
        let slot = GadgetSignature::new(&[sem.decode(&[0x48, 0x89, 0x07], 0).unwrap()], arch).compared(arch);
        // pop rax ; ret
        let pop = GadgetSignature::new(&sem.decode_block(&[0x58, 0xc3], 0x10, 4).unwrap(), arch);
        // mov [rsi], rax ; ret
        let store = GadgetSignature::new(&sem.decode_block(&[0x48, 0x89, 0x06, 0xc3], 0x20, 4).unwrap(), arch);
        assert!(slot.has_indirect_output());
        assert!(!pop.covers(&slot));
        assert!(store.covers(&slot));
    }

    #[test]
    fn flags_are_not_compared() {
        let sem = X86_64Semantics::new();
        let arch = sem.arch();
        // xor eax, eax
        let slot = GadgetSignature::new(&[sem.decode(&[0x31, 0xc0], 0).unwrap()], arch).compared(arch);
        // pop rax ; ret
        let pop = GadgetSignature::new(&sem.decode_block(&[0x58, 0xc3], 0x10, 4).unwrap(), arch);
        assert!(pop.covers(&slot));
    }
}
