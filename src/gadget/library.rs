//! Scanning binaries for gadgets and looking up candidates.

use std::{collections::BTreeMap, fmt, sync::Arc};

use num::Integer;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use tracing::{event, instrument, Level};

use crate::{
    bytecode::{Instruction, PcodeOp},
    config::library::GadgetLibraryConfig,
    error::{LiftError, SynthError},
    gadget::{Gadget, GadgetSignature},
    loader::Image,
    semantics::InstructionSemantics,
    ty::ArchInfo,
};

/// Load addresses of libraries are kept on 16 KiB boundaries.
pub const LIBRARY_ALIGNMENT: u64 = 0x4000;
/// Space left between an auxiliary library and whatever precedes it.
pub const LIBRARY_GAP: u64 = 0x1000;

pub fn align_up(x: u64, align: u64) -> u64 {
    if align == 0 {
        return x;
    }
    Integer::div_ceil(&x, &align) * align
}

fn aligned(address: u64, what: &str) -> u64 {
    let result = align_up(address, LIBRARY_ALIGNMENT);
    if result != address {
        event!(
            Level::WARN,
            "{} base address {:#x} is not {:#x}-aligned; aligning to {:#x}",
            what,
            address,
            LIBRARY_ALIGNMENT,
            result
        );
    }
    result
}

/// Every gadget found in the primary binary and its auxiliary libraries.
///
/// Library 0 is the primary binary; auxiliary libraries follow in
/// configuration order.
pub struct GadgetLibrary {
    semantics: Arc<dyn InstructionSemantics>,
    images: Vec<Image>,
    gadgets: Vec<Gadget>,
    lift_errors: BTreeMap<(usize, u64), LiftError>,
}

impl fmt::Debug for GadgetLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GadgetLibrary")
            .field("images", &self.images.iter().map(Image::name).collect::<Vec<_>>())
            .field("gadgets", &self.gadgets.len())
            .field("lift_errors", &self.lift_errors.len())
            .finish()
    }
}

// Decode from `address` until the first control transfer.
//
// `Ok(None)` when the run is not a gadget; decode failures are reported.
fn scan(
    semantics: &dyn InstructionSemantics,
    bytes: &[u8],
    address: u64,
    max_length: usize,
) -> Result<Option<Vec<Instruction>>, LiftError> {
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut offset = 0;
    while instructions.len() < max_length && offset < bytes.len() {
        let instruction = semantics.decode(&bytes[offset..], address + offset as u64)?;
        offset += instruction.length;
        let terminal = instruction.terminates_block();
        instructions.push(instruction);
        if terminal {
            let direct = instructions
                .iter()
                .flat_map(|i| &i.ops)
                .any(|op| matches!(op, PcodeOp::Branch { .. } | PcodeOp::Call { .. } | PcodeOp::CBranch { .. }));
            let usable = instructions.last().map_or(false, Instruction::ends_with_indirect_transfer);
            return Ok((usable && !direct).then(|| instructions));
        }
    }
    Ok(None)
}

impl GadgetLibrary {
    /// Load the configured binaries and scan them.
    pub fn build(
        config: &GadgetLibraryConfig,
        semantics: Arc<dyn InstructionSemantics>,
        seed: u64,
    ) -> Result<Self, SynthError> {
        let mut primary = Image::from_file(&config.path)?;
        if let Some(base) = config.base_address {
            primary.rebase(aligned(base, "main library"));
        }
        let mut images = vec![primary];
        for loaded in config.loaded_libraries.iter().flatten() {
            let mut image = Image::from_file(&loaded.path)?;
            let base = match loaded.base_address {
                Some(base) => aligned(base, &loaded.path),
                None => {
                    let end = images.iter().map(Image::max_address).max().unwrap_or(0);
                    align_up(end + LIBRARY_GAP, LIBRARY_ALIGNMENT)
                }
            };
            event!(Level::INFO, "placing {} at {:#x}", loaded.path, base);
            image.rebase(base);
            images.push(image);
        }
        Self::build_from_images(images, semantics, config.max_gadget_length, config.sample_size, seed)
    }

    /// Scan already-placed images.
    #[instrument(skip_all, fields(images = images.len()))]
    pub fn build_from_images(
        images: Vec<Image>,
        semantics: Arc<dyn InstructionSemantics>,
        max_gadget_length: usize,
        sample_size: Option<usize>,
        seed: u64,
    ) -> Result<Self, SynthError> {
        let mut gadgets = Vec::new();
        let mut lift_errors = BTreeMap::new();
        for (library, image) in images.iter().enumerate() {
            for segment in image.executable_segments() {
                let found: Vec<_> = (0..segment.data.len())
                    .into_par_iter()
                    .map(|offset| {
                        let address = segment.base_address + offset as u64;
                        scan(semantics.as_ref(), &segment.data[offset..], address, max_gadget_length)
                    })
                    .collect();
                for result in found {
                    match result {
                        Ok(Some(instructions)) => gadgets.extend(Gadget::new(library, instructions)),
                        Ok(None) => {}
                        Err(e) => {
                            lift_errors.entry((library, e.address)).or_insert(e);
                        }
                    }
                }
            }
        }
        event!(Level::DEBUG, "{} addresses failed to lift", lift_errors.len());
        if gadgets.is_empty() {
            return Err(SynthError::NoGadgetsFound);
        }
        if let Some(size) = sample_size {
            if size < gadgets.len() {
                let mut rng = StdRng::seed_from_u64(seed);
                gadgets = gadgets.choose_multiple(&mut rng, size).cloned().collect();
            }
        }
        gadgets.sort_by_key(Gadget::id);
        event!(Level::INFO, "found {} gadgets", gadgets.len());
        Ok(Self { semantics, images, gadgets, lift_errors })
    }

    pub fn arch(&self) -> &Arc<ArchInfo> {
        self.semantics.arch()
    }

    pub fn semantics(&self) -> &Arc<dyn InstructionSemantics> {
        &self.semantics
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn gadgets(&self) -> &[Gadget] {
        &self.gadgets
    }

    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    /// Addresses that could not be decoded, keyed by `(library, address)`.
    pub fn lift_errors(&self) -> &BTreeMap<(usize, u64), LiftError> {
        &self.lift_errors
    }

    pub fn gadget(&self, library: usize, address: u64) -> Option<&Gadget> {
        self.gadgets
            .binary_search_by_key(&(library, address), Gadget::id)
            .ok()
            .map(|i| &self.gadgets[i])
    }

    /// Decode `count` instructions at `address` again, from the loaded bytes.
    pub fn relift(&self, library: usize, address: u64, count: usize) -> Result<Vec<Instruction>, SynthError> {
        let image = self.images.get(library).ok_or(SynthError::UnmappedAddress(address))?;
        let bytes = image.bytes_from(address).ok_or(SynthError::UnmappedAddress(address))?;
        let instructions = self.semantics.decode_block(bytes, address, count)?;
        if instructions.len() != count {
            return Err(SynthError::UnmappedAddress(address + instructions.iter().map(|i| i.length as u64).sum::<u64>()));
        }
        Ok(instructions)
    }

    /// Up to `limit` gadgets that plausibly stand in for `slot`.
    ///
    /// The order is fixed by `seed`, so a larger `limit` returns a superset.
    pub fn candidates_for(&self, slot: &[Instruction], limit: usize, seed: u64) -> Vec<&Gadget> {
        let arch = self.arch();
        let wanted = GadgetSignature::new(slot, arch).compared(arch);
        let user_ops: Vec<&PcodeOp> = slot.iter().flat_map(|i| i.user_ops()).collect();
        let mut order: Vec<usize> = (0..self.gadgets.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        order
            .into_iter()
            .map(|i| &self.gadgets[i])
            .filter(|g| g.user_ops().collect::<Vec<_>>() == user_ops)
            .filter(|g| g.signature(arch).covers(&wanted))
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantics::x86::X86_64Semantics;

    fn library(bytes: &[u8], sample: Option<usize>) -> Result<GadgetLibrary, SynthError> {
        let images = vec![Image::from_raw("test", 0x1000, bytes)];
        GadgetLibrary::build_from_images(images, Arc::new(X86_64Semantics::new()), 4, sample, 7)
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0x4000, LIBRARY_ALIGNMENT), 0x4000);
        assert_eq!(align_up(0x4001, LIBRARY_ALIGNMENT), 0x8000);
        assert_eq!(align_up(0, LIBRARY_ALIGNMENT), 0);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn finds_every_suffix_ending_in_return() {
        // pop rdi ; pop rsi ; ret
        let lib = library(&[0x5f, 0x5e, 0xc3], None).unwrap();
        let addresses: Vec<_> = lib.gadgets().iter().map(Gadget::address).collect();
        assert_eq!(addresses, vec![0x1000, 0x1001, 0x1002]);
        assert_eq!(lib.gadget(0, 0x1000).map(Gadget::len), Some(3));
        assert!(lib.lift_errors().is_empty());
    }

    #[test]
    fn direct_branches_are_rejected() {
        // jmp +0 ; ret
        let lib = library(&[0xeb, 0x00, 0xc3], None).unwrap();
        let addresses: Vec<_> = lib.gadgets().iter().map(Gadget::address).collect();
        assert_eq!(addresses, vec![0x1002]);
    }

    #[test]
    fn no_indirect_transfer_means_no_gadgets() {
        // pop rdi ; pop rsi
        assert!(matches!(library(&[0x5f, 0x5e], None), Err(SynthError::NoGadgetsFound)));
    }

    #[test]
    fn undecodable_bytes_are_collected() {
        // hlt ; ret
        let lib = library(&[0xf4, 0xc3], None).unwrap();
        assert_eq!(lib.len(), 1);
        assert!(lib.lift_errors().contains_key(&(0, 0x1000)));
    }

    #[test]
    fn sampling_is_reproducible() {
        let bytes = [0x5f, 0xc3, 0x5e, 0xc3, 0x58, 0xc3, 0x5a, 0xc3, 0x59, 0xc3];
        let a = library(&bytes, Some(3)).unwrap();
        let b = library(&bytes, Some(3)).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.gadgets(), b.gadgets());
        assert!(a.gadgets().windows(2).all(|w| w[0].id() < w[1].id()));
    }

    #[test]
    fn candidates_grow_monotonically() {
        let bytes = [0x5f, 0xc3, 0x5e, 0xc3, 0x58, 0xc3, 0x48, 0x31, 0xc0, 0xc3];
        let lib = library(&bytes, None).unwrap();
        let sem = X86_64Semantics::new();
        // xor eax, eax
        let slot = vec![sem.decode(&[0x31, 0xc0], 0).unwrap()];
        let small = lib.candidates_for(&slot, 1, 3);
        let large = lib.candidates_for(&slot, 10, 3);
        assert_eq!(small.len(), 1);
        assert!(small.iter().all(|g| large.contains(g)));
        assert!(large.iter().all(|g| g.signature(lib.arch()).covers(&GadgetSignature::new(&slot, lib.arch()).compared(lib.arch()))));
    }

    #[test]
    fn relift_reproduces_gadgets() {
        let lib = library(&[0x5f, 0x5e, 0xc3], None).unwrap();
        let gadget = lib.gadget(0, 0x1001).unwrap();
        assert_eq!(lib.relift(0, 0x1001, gadget.len()).unwrap(), gadget.instructions());
        assert!(lib.relift(0, 0x9000, 1).is_err());
    }
}
