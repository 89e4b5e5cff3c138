use std::sync::Arc;

use z3::{
  ast::{Array, Ast, Bool, BV},
  Context,
};

use crate::{
  bytecode::VarNode,
  error::{ConfigError, SynthError},
  ty::{address_sort, byte_sort, ArchInfo, SpaceIndex, ADDRESS_BITS},
  value::{constant, from_le_bytes, le_bytes, resize, ResolvedVarNode},
};

pub mod arena;

pub use arena::{Generation, StateArena};

/// Symbolic machine state at one program point.
///
/// Every non-constant space is an array from addresses to bytes. Writes
/// produce a new state; the arrays of a fresh state are free constants named
/// after the space and the generation.
#[derive(Clone, Debug)]
pub struct State<'ctx> {
  ctx: &'ctx Context,
  arch: Arc<ArchInfo>,
  generation: Generation,
  spaces: Vec<Option<Array<'ctx>>>,
}

impl<'ctx> State<'ctx> {
  pub fn new(ctx: &'ctx Context, arch: &Arc<ArchInfo>, generation: Generation) -> Self {
    let spaces = arch
      .spaces()
      .iter()
      .enumerate()
      .map(|(i, space)| {
        if arch.is_const(i) {
          None
        } else {
          Some(Array::new_const(
            ctx,
            format!("{}_{}", space.name, generation.index()),
            &address_sort(ctx),
            &byte_sort(ctx),
          ))
        }
      })
      .collect();
    Self { ctx, arch: arch.clone(), generation, spaces }
  }

  pub fn get_ctx(&self) -> &'ctx Context {
    self.ctx
  }

  pub fn arch(&self) -> &Arc<ArchInfo> {
    &self.arch
  }

  pub fn generation(&self) -> Generation {
    self.generation
  }

  fn space_array(&self, space: SpaceIndex, offset: u64) -> Result<&Array<'ctx>, SynthError> {
    match self.spaces.get(space) {
      Some(Some(array)) => Ok(array),
      _ => Err(SynthError::InvalidAccess {
        space: self.space_name(space),
        offset,
        reason: "space holds no storage".into(),
      }),
    }
  }

  fn space_name(&self, space: SpaceIndex) -> String {
    self.arch.space(space).map_or_else(|| space.to_string(), |s| s.name.clone())
  }

  fn byte_addresses(&self, base: &BV<'ctx>, size: usize) -> Vec<BV<'ctx>> {
    (0..size as u64)
      .map(|i| {
        if i == 0 {
          base.clone()
        } else {
          base.bvadd(&BV::from_u64(self.ctx, i, ADDRESS_BITS))
        }
      })
      .collect()
  }

  fn load(&self, array: &Array<'ctx>, base: &BV<'ctx>, size: usize) -> Result<BV<'ctx>, SynthError> {
    let mut bytes = Vec::with_capacity(size);
    for address in self.byte_addresses(base, size) {
      let byte = array.select(&address).as_bv().ok_or_else(|| SynthError::SizeMismatch(
        "space contents are not bit-vectors".into(),
      ))?;
      bytes.push(byte);
    }
    if self.arch.big_endian() {
      bytes.reverse();
    }
    from_le_bytes(bytes).ok_or_else(|| SynthError::SizeMismatch("zero-sized read".into()))
  }

  fn store(&self, array: &Array<'ctx>, base: &BV<'ctx>, value: &BV<'ctx>) -> Array<'ctx> {
    let mut bytes = le_bytes(value);
    if self.arch.big_endian() {
      bytes.reverse();
    }
    self.byte_addresses(base, bytes.len())
      .iter()
      .zip(bytes.iter())
      .fold(array.clone(), |acc, (address, byte)| acc.store(address, byte))
  }

  /// Read a varnode. Constants evaluate to themselves.
  pub fn read(&self, vn: &VarNode) -> Result<BV<'ctx>, SynthError> {
    if vn.size == 0 {
      return Err(SynthError::SizeMismatch(format!("zero-sized varnode {}", vn)));
    }
    if self.arch.is_const(vn.space) {
      return Ok(constant(self.ctx, vn.offset, vn.size));
    }
    let array = self.space_array(vn.space, vn.offset)?;
    self.load(array, &BV::from_u64(self.ctx, vn.offset, ADDRESS_BITS), vn.size)
  }

  pub fn write(&self, vn: &VarNode, value: &BV<'ctx>) -> Result<Self, SynthError> {
    if value.get_size() as usize != vn.size * 8 {
      return Err(SynthError::SizeMismatch(format!(
        "writing {} bits to {}",
        value.get_size(),
        vn
      )));
    }
    let array = self.space_array(vn.space, vn.offset)?;
    let updated = self.store(array, &BV::from_u64(self.ctx, vn.offset, ADDRESS_BITS), value);
    Ok(self.with_space(vn.space, updated))
  }

  pub fn read_indirect(&self, space: SpaceIndex, pointer: &BV<'ctx>, size: usize) -> Result<BV<'ctx>, SynthError> {
    let array = self.space_array(space, 0)?;
    self.load(array, &resize(pointer, ADDRESS_BITS), size)
  }

  pub fn write_indirect(&self, space: SpaceIndex, pointer: &BV<'ctx>, value: &BV<'ctx>) -> Result<Self, SynthError> {
    let array = self.space_array(space, 0)?;
    let updated = self.store(array, &resize(pointer, ADDRESS_BITS), value);
    Ok(self.with_space(space, updated))
  }

  pub fn read_resolved(&self, location: &ResolvedVarNode<'ctx>) -> Result<BV<'ctx>, SynthError> {
    match location {
      ResolvedVarNode::Direct(vn) => self.read(vn),
      ResolvedVarNode::Indirect(ind) => self.read_indirect(ind.space, &ind.pointer, ind.access_size),
    }
  }

  /// Read a register by name.
  pub fn register(&self, name: &str) -> Result<BV<'ctx>, SynthError> {
    let vn = *self
      .arch
      .register(name)
      .ok_or_else(|| ConfigError::UnknownRegister(name.to_string()))?;
    self.read(&vn)
  }

  /// Read `size` bytes of ram at a concrete address.
  pub fn memory(&self, address: u64, size: usize) -> Result<BV<'ctx>, SynthError> {
    self.read(&VarNode::new(self.arch.ram_space(), address, size))
  }

  fn with_space(&self, space: SpaceIndex, array: Array<'ctx>) -> Self {
    let mut spaces = self.spaces.clone();
    spaces[space] = Some(array);
    Self { spaces, ..self.clone() }
  }

  /// Equality of every persistent space.
  pub fn equals(&self, other: &Self) -> Bool<'ctx> {
    let equalities: Vec<Bool<'ctx>> = self
      .arch
      .persistent_spaces()
      .filter_map(|i| match (&self.spaces[i], other.spaces.get(i)) {
        (Some(a), Some(Some(b))) => Some(a._eq(b)),
        _ => None,
      })
      .collect();
    Bool::and(self.ctx, &equalities.iter().collect::<Vec<_>>())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::semantics::{x86::X86_64Semantics, InstructionSemantics};
  use z3::{Config, SatResult, Solver};

  fn arch() -> Arc<ArchInfo> {
    X86_64Semantics::new().arch().clone()
  }

  #[test]
  fn unwritten_reads_are_fresh_per_generation() {
    let ctx = Context::new(&Config::new());
    let arch = arch();
    let mut arena = StateArena::new();
    let a = State::new(&ctx, &arch, arena.fresh());
    let b = State::new(&ctx, &arch, arena.fresh());
    let again = State::new(&ctx, &arch, a.generation());
    let rax_a = a.register("RAX").unwrap();
    assert_eq!(rax_a, again.register("rax").unwrap());
    let solver = Solver::new(&ctx);
    solver.assert(&rax_a._eq(&b.register("RAX").unwrap()).not());
    assert_eq!(solver.check(), SatResult::Sat);
  }

  #[test]
  fn write_then_read_sub_register() {
    let ctx = Context::new(&Config::new());
    let state = State::new(&ctx, &arch(), StateArena::new().fresh());
    let rax = *state.arch().register("RAX").unwrap();
    let written = state.write(&rax, &BV::from_u64(&ctx, 0x1122_3344_5566_7788, 64)).unwrap();
    let eax = written.register("EAX").unwrap().simplify();
    assert_eq!(eax.as_u64(), Some(0x5566_7788));
    let al = written.register("AL").unwrap().simplify();
    assert_eq!(al.as_u64(), Some(0x88));
  }

  #[test]
  fn indirect_write_is_little_endian() {
    let ctx = Context::new(&Config::new());
    let state = State::new(&ctx, &arch(), StateArena::new().fresh());
    let ram = state.arch().ram_space();
    let ptr = BV::from_u64(&ctx, 0x1000, 64);
    let written = state.write_indirect(ram, &ptr, &BV::from_u64(&ctx, 0xaabb, 16)).unwrap();
    assert_eq!(written.memory(0x1000, 1).unwrap().simplify().as_u64(), Some(0xbb));
    assert_eq!(written.memory(0x1001, 1).unwrap().simplify().as_u64(), Some(0xaa));
  }

  #[test]
  fn constant_space_is_read_only() {
    let ctx = Context::new(&Config::new());
    let state = State::new(&ctx, &arch(), StateArena::new().fresh());
    let c = VarNode::new(state.arch().const_space(), 7, 2);
    assert_eq!(state.read(&c).unwrap().simplify().as_u64(), Some(7));
    assert!(state.write(&c, &BV::from_u64(&ctx, 1, 16)).is_err());
  }
}
