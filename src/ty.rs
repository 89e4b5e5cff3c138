//! Address spaces, registers and the sorts used to model them.

use std::collections::BTreeMap;

use z3::{Context, Sort};

use crate::bytecode::VarNode;

pub type SpaceIndex = usize;

/// Width of every address-space index in the solver.
pub const ADDRESS_BITS: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceKind {
  Constant,
  Register,
  Ram,
  Unique,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceInfo {
  pub name: String,
  pub kind: SpaceKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
  pub name: String,
  pub varnode: VarNode,
  /// Full-width registers reported in results.
  pub primary: bool,
  pub flag: bool,
}

/// Static description of a processor: its spaces and named registers.
#[derive(Clone, Debug)]
pub struct ArchInfo {
  spaces: Vec<SpaceInfo>,
  registers: Vec<RegisterInfo>,
  by_name: BTreeMap<String, usize>,
  stack_pointer: VarNode,
  program_counter: VarNode,
  big_endian: bool,
}

impl ArchInfo {
  pub fn new(
    spaces: Vec<SpaceInfo>,
    registers: Vec<RegisterInfo>,
    stack_pointer: VarNode,
    program_counter: VarNode,
    big_endian: bool,
  ) -> Self {
    let by_name = registers
      .iter()
      .enumerate()
      .map(|(i, r)| (r.name.to_ascii_uppercase(), i))
      .collect();
    Self { spaces, registers, by_name, stack_pointer, program_counter, big_endian }
  }

  pub fn spaces(&self) -> &[SpaceInfo] {
    &self.spaces
  }

  pub fn space(&self, index: SpaceIndex) -> Option<&SpaceInfo> {
    self.spaces.get(index)
  }

  pub fn space_by_name(&self, name: &str) -> Option<SpaceIndex> {
    self.spaces.iter().position(|s| s.name == name)
  }

  fn space_of_kind(&self, kind: SpaceKind) -> SpaceIndex {
    self.spaces.iter().position(|s| s.kind == kind).unwrap_or(0)
  }

  pub fn const_space(&self) -> SpaceIndex {
    self.space_of_kind(SpaceKind::Constant)
  }

  pub fn register_space(&self) -> SpaceIndex {
    self.space_of_kind(SpaceKind::Register)
  }

  pub fn ram_space(&self) -> SpaceIndex {
    self.space_of_kind(SpaceKind::Ram)
  }

  pub fn unique_space(&self) -> SpaceIndex {
    self.space_of_kind(SpaceKind::Unique)
  }

  pub fn is_const(&self, space: SpaceIndex) -> bool {
    self.space(space).map_or(false, |s| s.kind == SpaceKind::Constant)
  }

  /// Spaces that persist across instructions and take part in state equality.
  pub fn persistent_spaces(&self) -> impl Iterator<Item = SpaceIndex> + '_ {
    self.spaces
      .iter()
      .enumerate()
      .filter(|(_, s)| matches!(s.kind, SpaceKind::Register | SpaceKind::Ram))
      .map(|(i, _)| i)
  }

  /// Case-insensitive register lookup.
  pub fn register(&self, name: &str) -> Option<&VarNode> {
    self.by_name
      .get(&name.to_ascii_uppercase())
      .map(|&i| &self.registers[i].varnode)
  }

  /// Name of the register occupying exactly `varnode`, if any.
  pub fn register_name(&self, varnode: &VarNode) -> Option<&str> {
    self.registers
      .iter()
      .find(|r| &r.varnode == varnode)
      .map(|r| r.name.as_str())
  }

  pub fn primary_registers(&self) -> impl Iterator<Item = &RegisterInfo> {
    self.registers.iter().filter(|r| r.primary)
  }

  pub fn is_flag(&self, varnode: &VarNode) -> bool {
    self.registers.iter().any(|r| r.flag && r.varnode.covers(varnode))
  }

  pub fn stack_pointer(&self) -> &VarNode {
    &self.stack_pointer
  }

  pub fn program_counter(&self) -> &VarNode {
    &self.program_counter
  }

  pub fn big_endian(&self) -> bool {
    self.big_endian
  }

  /// Locations that are free to differ between a slot and the gadget
  /// realizing it.
  pub fn is_dont_care(&self, varnode: &VarNode) -> bool {
    let overlaps = |r: &VarNode| {
      r.space == varnode.space
        && varnode.offset < r.offset + r.size as u64
        && r.offset < varnode.offset + varnode.size as u64
    };
    overlaps(&self.stack_pointer)
      || overlaps(&self.program_counter)
      || self.is_flag(varnode)
      || self.space(varnode.space).map_or(true, |s| matches!(s.kind, SpaceKind::Unique | SpaceKind::Constant))
  }

  /// Pretty name of a location: a register name when one matches.
  pub fn describe(&self, varnode: &VarNode) -> String {
    match self.register_name(varnode) {
      Some(name) => name.to_string(),
      None => {
        let space = self.space(varnode.space).map_or("?", |s| s.name.as_str());
        format!("{}[{:#x}]:{}", space, varnode.offset, varnode.size)
      }
    }
  }
}

/// Sort of space indices.
pub fn address_sort(ctx: &Context) -> Sort<'_> {
  Sort::bitvector(ctx, ADDRESS_BITS)
}

/// Sort of space contents.
pub fn byte_sort(ctx: &Context) -> Sort<'_> {
  Sort::bitvector(ctx, 8)
}
