use std::fmt::{self, Display};

use itertools::Itertools;
use serde::Serialize;

use crate::ty::SpaceIndex;

pub mod text;

/// A storage location: `size` bytes at `offset` in address space `space`.
///
/// In the constant space the offset is the value itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VarNode {
  pub space: SpaceIndex,
  pub offset: u64,
  pub size: usize,
}

impl VarNode {
  pub fn new(space: SpaceIndex, offset: u64, size: usize) -> Self {
    Self { space, offset, size }
  }

  /// Does `self` cover every byte of `other`?
  pub fn covers(&self, other: &VarNode) -> bool {
    self.space == other.space
      && self.offset <= other.offset
      && other.offset + other.size as u64 <= self.offset + self.size as u64
  }

  pub fn bytes(&self) -> impl Iterator<Item = (SpaceIndex, u64)> + '_ {
    (0..self.size as u64).map(move |i| (self.space, self.offset + i))
  }
}

impl Display for VarNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{:#x}]:{}", self.space, self.offset, self.size)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
  IntAdd,
  IntSub,
  IntMult,
  IntDiv,
  IntSDiv,
  IntRem,
  IntSRem,
  IntAnd,
  IntOr,
  IntXor,
  IntLeft,
  IntRight,
  IntSRight,
  IntEqual,
  IntNotEqual,
  IntLess,
  IntSLess,
  IntLessEqual,
  IntSLessEqual,
  IntCarry,
  IntSCarry,
  IntSBorrow,
  BoolAnd,
  BoolOr,
  BoolXor,
}

impl BinaryOp {
  /// Comparisons and carry tests produce a single byte holding 0 or 1.
  pub fn is_predicate(&self) -> bool {
    use BinaryOp::*;
    matches!(
      self,
      IntEqual | IntNotEqual | IntLess | IntSLess | IntLessEqual | IntSLessEqual | IntCarry | IntSCarry | IntSBorrow
    )
  }

  pub fn mnemonic(&self) -> &'static str {
    use BinaryOp::*;
    match self {
      IntAdd => "INT_ADD",
      IntSub => "INT_SUB",
      IntMult => "INT_MULT",
      IntDiv => "INT_DIV",
      IntSDiv => "INT_SDIV",
      IntRem => "INT_REM",
      IntSRem => "INT_SREM",
      IntAnd => "INT_AND",
      IntOr => "INT_OR",
      IntXor => "INT_XOR",
      IntLeft => "INT_LEFT",
      IntRight => "INT_RIGHT",
      IntSRight => "INT_SRIGHT",
      IntEqual => "INT_EQUAL",
      IntNotEqual => "INT_NOTEQUAL",
      IntLess => "INT_LESS",
      IntSLess => "INT_SLESS",
      IntLessEqual => "INT_LESSEQUAL",
      IntSLessEqual => "INT_SLESSEQUAL",
      IntCarry => "INT_CARRY",
      IntSCarry => "INT_SCARRY",
      IntSBorrow => "INT_SBORROW",
      BoolAnd => "BOOL_AND",
      BoolOr => "BOOL_OR",
      BoolXor => "BOOL_XOR",
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOp {
  IntNegate,
  Int2Comp,
  IntZExt,
  IntSExt,
  BoolNegate,
  Popcount,
}

impl UnaryOp {
  pub fn mnemonic(&self) -> &'static str {
    match self {
      UnaryOp::IntNegate => "INT_NEGATE",
      UnaryOp::Int2Comp => "INT_2COMP",
      UnaryOp::IntZExt => "INT_ZEXT",
      UnaryOp::IntSExt => "INT_SEXT",
      UnaryOp::BoolNegate => "BOOL_NEGATE",
      UnaryOp::Popcount => "POPCOUNT",
    }
  }
}

/// Architecture-neutral effect of an instruction, one step at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PcodeOp {
  Copy { input: VarNode, output: VarNode },
  Load { space: SpaceIndex, pointer: VarNode, output: VarNode },
  Store { space: SpaceIndex, pointer: VarNode, input: VarNode },
  Binary { op: BinaryOp, lhs: VarNode, rhs: VarNode, output: VarNode },
  Unary { op: UnaryOp, input: VarNode, output: VarNode },
  /// Truncate `input` after dropping `offset` low bytes.
  SubPiece { input: VarNode, offset: usize, output: VarNode },
  Branch { target: u64 },
  CBranch { target: u64, condition: VarNode },
  BranchInd { target: VarNode },
  Call { target: u64 },
  CallInd { target: VarNode },
  Return { target: VarNode },
  CallOther { name: String, inputs: Vec<VarNode>, output: Option<VarNode> },
}

impl PcodeOp {
  pub fn output(&self) -> Option<&VarNode> {
    match self {
      PcodeOp::Copy { output, .. }
      | PcodeOp::Load { output, .. }
      | PcodeOp::Binary { output, .. }
      | PcodeOp::Unary { output, .. }
      | PcodeOp::SubPiece { output, .. } => Some(output),
      PcodeOp::CallOther { output, .. } => output.as_ref(),
      _ => None,
    }
  }

  /// Varnodes read directly by this operation, in operand order.
  pub fn inputs(&self) -> Vec<&VarNode> {
    match self {
      PcodeOp::Copy { input, .. } | PcodeOp::Unary { input, .. } | PcodeOp::SubPiece { input, .. } => vec![input],
      PcodeOp::Load { pointer, .. } => vec![pointer],
      PcodeOp::Store { pointer, input, .. } => vec![pointer, input],
      PcodeOp::Binary { lhs, rhs, .. } => vec![lhs, rhs],
      PcodeOp::CBranch { condition, .. } => vec![condition],
      PcodeOp::BranchInd { target } | PcodeOp::CallInd { target } | PcodeOp::Return { target } => vec![target],
      PcodeOp::CallOther { inputs, .. } => inputs.iter().collect(),
      PcodeOp::Branch { .. } | PcodeOp::Call { .. } => vec![],
    }
  }

  /// Does the operation leave the fall-through path?
  pub fn is_control_transfer(&self) -> bool {
    matches!(
      self,
      PcodeOp::Branch { .. }
        | PcodeOp::CBranch { .. }
        | PcodeOp::BranchInd { .. }
        | PcodeOp::Call { .. }
        | PcodeOp::CallInd { .. }
        | PcodeOp::Return { .. }
    )
  }

  /// Transfers whose destination comes from state, usable to chain gadgets.
  pub fn is_indirect_transfer(&self) -> bool {
    matches!(self, PcodeOp::BranchInd { .. } | PcodeOp::CallInd { .. } | PcodeOp::Return { .. })
  }

  pub fn mnemonic(&self) -> &'static str {
    match self {
      PcodeOp::Copy { .. } => "COPY",
      PcodeOp::Load { .. } => "LOAD",
      PcodeOp::Store { .. } => "STORE",
      PcodeOp::Binary { op, .. } => op.mnemonic(),
      PcodeOp::Unary { op, .. } => op.mnemonic(),
      PcodeOp::SubPiece { .. } => "SUBPIECE",
      PcodeOp::Branch { .. } => "BRANCH",
      PcodeOp::CBranch { .. } => "CBRANCH",
      PcodeOp::BranchInd { .. } => "BRANCHIND",
      PcodeOp::Call { .. } => "CALL",
      PcodeOp::CallInd { .. } => "CALLIND",
      PcodeOp::Return { .. } => "RETURN",
      PcodeOp::CallOther { .. } => "CALLOTHER",
    }
  }
}

impl Display for PcodeOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(output) = self.output() {
      write!(f, "{} = ", output)?;
    }
    write!(f, "{}", self.mnemonic())?;
    match self {
      PcodeOp::Branch { target } | PcodeOp::Call { target } => write!(f, " {:#x}", target),
      PcodeOp::CBranch { target, condition } => write!(f, " {:#x}, {}", target, condition),
      PcodeOp::CallOther { name, inputs, .. } => {
        write!(f, " {}", name)?;
        for input in inputs {
          write!(f, ", {}", input)?;
        }
        Ok(())
      }
      PcodeOp::SubPiece { input, offset, .. } => write!(f, " {}, {}", input, offset),
      _ => write!(f, " {}", self.inputs().iter().format(", ")),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Disassembly {
  pub mnemonic: String,
  pub args: String,
}

impl Display for Disassembly {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.args.is_empty() {
      write!(f, "{}", self.mnemonic)
    } else {
      write!(f, "{} {}", self.mnemonic, self.args)
    }
  }
}

/// A decoded machine instruction with its lifted effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Instruction {
  pub address: u64,
  pub length: usize,
  pub disassembly: Disassembly,
  pub ops: Vec<PcodeOp>,
}

impl Instruction {
  pub fn terminates_block(&self) -> bool {
    self.ops.iter().any(|op| op.is_control_transfer())
  }

  pub fn ends_with_indirect_transfer(&self) -> bool {
    self.ops.last().map_or(false, |op| op.is_indirect_transfer())
  }

  pub fn has_conditional_branch(&self) -> bool {
    self.ops.iter().any(|op| matches!(op, PcodeOp::CBranch { .. }))
  }

  /// Named user operations (such as `syscall`) performed by the instruction.
  pub fn user_ops(&self) -> impl Iterator<Item = &PcodeOp> {
    self.ops.iter().filter(|op| matches!(op, PcodeOp::CallOther { .. }))
  }

  /// Fuse consecutive instructions into one whose effect is their composition.
  ///
  /// Only the last instruction may transfer control.
  pub fn combine(instructions: &[Instruction]) -> Option<Instruction> {
    let (last, init) = instructions.split_last()?;
    if init.iter().any(|i| i.terminates_block()) {
      return None;
    }
    let first = instructions.first()?;
    Some(Instruction {
      address: first.address,
      length: instructions.iter().map(|i| i.length).sum(),
      disassembly: Disassembly {
        mnemonic: instructions.iter().map(|i| i.disassembly.to_string()).join("; "),
        args: String::new(),
      },
      ops: init.iter().chain(std::iter::once(last)).flat_map(|i| i.ops.iter().cloned()).collect(),
    })
  }
}

impl Display for Instruction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}: {}", self.address, self.disassembly)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn nop(address: u64) -> Instruction {
    Instruction {
      address,
      length: 1,
      disassembly: Disassembly { mnemonic: "nop".into(), args: String::new() },
      ops: vec![],
    }
  }

  fn ret(address: u64) -> Instruction {
    Instruction {
      address,
      length: 1,
      disassembly: Disassembly { mnemonic: "ret".into(), args: String::new() },
      ops: vec![PcodeOp::Return { target: VarNode::new(2, 0x288, 8) }],
    }
  }

  #[test]
  fn covers_is_bytewise() {
    let rax = VarNode::new(2, 0, 8);
    let eax = VarNode::new(2, 0, 4);
    let rcx = VarNode::new(2, 8, 8);
    assert!(rax.covers(&eax));
    assert!(!eax.covers(&rax));
    assert!(!rax.covers(&rcx));
  }

  #[test]
  fn combine_concatenates_in_order() {
    let fused = Instruction::combine(&[nop(0x10), nop(0x11), ret(0x12)]).unwrap();
    assert_eq!(fused.address, 0x10);
    assert_eq!(fused.length, 3);
    assert_eq!(fused.disassembly.to_string(), "nop; nop; ret");
    assert!(fused.ends_with_indirect_transfer());
  }

  #[test]
  fn combine_rejects_inner_transfer() {
    assert!(Instruction::combine(&[ret(0x10), nop(0x11)]).is_none());
    assert!(Instruction::combine(&[]).is_none());
  }
}
