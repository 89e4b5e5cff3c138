use std::fmt::{self, Display};

use z3::{
  ast::{Ast, Bool, BV},
  Context,
};

use crate::{bytecode::VarNode, ty::SpaceIndex};

/// A location named without committing to its contents.
///
/// Indirect locations carry the symbolic pointer they were accessed through.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedVarNode<'ctx> {
  Direct(VarNode),
  Indirect(ResolvedIndirectVarNode<'ctx>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedIndirectVarNode<'ctx> {
  pub space: SpaceIndex,
  pub pointer: BV<'ctx>,
  pub access_size: usize,
}

impl<'ctx> ResolvedVarNode<'ctx> {
  pub fn size(&self) -> usize {
    match self {
      ResolvedVarNode::Direct(vn) => vn.size,
      ResolvedVarNode::Indirect(ind) => ind.access_size,
    }
  }

  pub fn space(&self) -> SpaceIndex {
    match self {
      ResolvedVarNode::Direct(vn) => vn.space,
      ResolvedVarNode::Indirect(ind) => ind.space,
    }
  }
}

impl<'ctx> Display for ResolvedVarNode<'ctx> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResolvedVarNode::Direct(vn) => write!(f, "{}", vn),
      ResolvedVarNode::Indirect(ind) => write!(f, "{}[{}]:{}", ind.space, ind.pointer, ind.access_size),
    }
  }
}

pub fn constant<'ctx>(ctx: &'ctx Context, value: u64, size: usize) -> BV<'ctx> {
  let bits = (size * 8) as u32;
  if bits <= 64 {
    BV::from_u64(ctx, value, bits)
  } else {
    BV::from_u64(ctx, value, 64).zero_ext(bits - 64)
  }
}

/// 1 when `b` holds, 0 otherwise, `size` bytes wide.
pub fn from_bool<'ctx>(b: &Bool<'ctx>, size: usize) -> BV<'ctx> {
  let ctx = b.get_ctx();
  b.ite(&constant(ctx, 1, size), &constant(ctx, 0, size))
}

/// Nonzero test.
pub fn to_bool<'ctx>(v: &BV<'ctx>) -> Bool<'ctx> {
  v._eq(&BV::from_u64(v.get_ctx(), 0, v.get_size())).not()
}

/// Zero-extend or truncate to `bits`.
pub fn resize<'ctx>(v: &BV<'ctx>, bits: u32) -> BV<'ctx> {
  let size = v.get_size();
  if size == bits {
    v.clone()
  } else if size < bits {
    v.zero_ext(bits - size)
  } else {
    v.extract(bits - 1, 0)
  }
}

/// Split a value into bytes, least significant first.
pub fn le_bytes<'ctx>(v: &BV<'ctx>) -> Vec<BV<'ctx>> {
  (0..v.get_size() / 8).map(|i| v.extract(i * 8 + 7, i * 8)).collect()
}

/// Join bytes given least significant first.
pub fn from_le_bytes<'ctx>(bytes: Vec<BV<'ctx>>) -> Option<BV<'ctx>> {
  bytes.into_iter().reduce(|low, high| high.concat(&low))
}
