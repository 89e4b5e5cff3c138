//! Symbolic semantics of individual p-code operations.

use std::collections::BTreeSet;

use z3::ast::{Ast, Bool, BV};

use crate::{
    bytecode::{BinaryOp, PcodeOp, UnaryOp, VarNode},
    error::SynthError,
    state::State,
    ty::{SpaceIndex, ADDRESS_BITS},
    value::{constant, from_bool, resize, to_bool, ResolvedIndirectVarNode, ResolvedVarNode},
};

/// How control leaves a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Branch,
    Call,
    Conditional,
    Indirect,
    IndirectCall,
    Return,
}

impl TransferKind {
    pub fn is_indirect(&self) -> bool {
        matches!(self, TransferKind::Indirect | TransferKind::IndirectCall | TransferKind::Return)
    }
}

#[derive(Clone, Debug)]
pub struct ControlTransfer<'ctx> {
    pub kind: TransferKind,
    pub target: BV<'ctx>,
}

/// Locations touched while stepping through a block.
#[derive(Clone, Debug, Default)]
pub struct Effects<'ctx> {
    pub inputs: Vec<ResolvedVarNode<'ctx>>,
    pub outputs: Vec<ResolvedVarNode<'ctx>>,
    pub transfer: Option<ControlTransfer<'ctx>>,
    pub user_ops: Vec<String>,
    written: BTreeSet<(SpaceIndex, u64)>,
}

impl<'ctx> Effects<'ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    // Record a direct read unless every byte was produced inside the block.
    fn read(&mut self, state: &State<'ctx>, vn: &VarNode) {
        let arch = state.arch();
        if arch.is_const(vn.space) || vn.space == arch.unique_space() {
            return;
        }
        let exposed = vn.bytes().any(|b| !self.written.contains(&b));
        let location = ResolvedVarNode::Direct(*vn);
        if exposed && !self.inputs.contains(&location) {
            self.inputs.push(location);
        }
    }

    fn write(&mut self, state: &State<'ctx>, vn: &VarNode) {
        if vn.space == state.arch().unique_space() {
            return;
        }
        self.written.extend(vn.bytes());
        let location = ResolvedVarNode::Direct(*vn);
        if !self.outputs.contains(&location) {
            self.outputs.push(location);
        }
    }
}

fn same_size(a: &BV, b: &BV, op: &str) -> Result<(), SynthError> {
    if a.get_size() == b.get_size() {
        Ok(())
    } else {
        Err(SynthError::SizeMismatch(format!("{} of {} and {} bits", op, a.get_size(), b.get_size())))
    }
}

fn sign<'ctx>(v: &BV<'ctx>) -> BV<'ctx> {
    let top = v.get_size() - 1;
    v.extract(top, top)
}

// Evaluate a binary operation producing `size` bytes.
fn binary<'ctx>(op: BinaryOp, a: &BV<'ctx>, b: &BV<'ctx>, size: usize) -> Result<BV<'ctx>, SynthError> {
    use BinaryOp::*;
    if matches!(op, IntLeft | IntRight | IntSRight) {
        // Shift at the wider width so large amounts are not truncated.
        let bits = a.get_size();
        let width = bits.max(b.get_size());
        let amount = resize(b, width);
        let shifted = match op {
            IntLeft => resize(a, width).bvshl(&amount),
            IntRight => resize(a, width).bvlshr(&amount),
            _ if width > bits => a.sign_ext(width - bits).bvashr(&amount),
            _ => a.bvashr(&amount),
        };
        return Ok(resize(&shifted, bits));
    }
    same_size(a, b, op.mnemonic())?;
    let predicate: Bool<'ctx> = match op {
        IntEqual => a._eq(b),
        IntNotEqual => a._eq(b).not(),
        IntLess => a.bvult(b),
        IntSLess => a.bvslt(b),
        IntLessEqual => a.bvule(b),
        IntSLessEqual => a.bvsle(b),
        IntCarry => a.bvadd(b).bvult(a),
        IntSCarry => {
            let r = a.bvadd(b);
            sign(a)._eq(&sign(b)) & sign(&r)._eq(&sign(a)).not()
        }
        IntSBorrow => {
            let r = a.bvsub(b);
            sign(a)._eq(&sign(b)).not() & sign(&r)._eq(&sign(a)).not()
        }
        _ => {
            return Ok(match op {
                IntAdd => a.bvadd(b),
                IntSub => a.bvsub(b),
                IntMult => a.bvmul(b),
                IntDiv => a.bvudiv(b),
                IntSDiv => a.bvsdiv(b),
                IntRem => a.bvurem(b),
                IntSRem => a.bvsrem(b),
                IntAnd | BoolAnd => a.bvand(b),
                IntOr | BoolOr => a.bvor(b),
                _ => a.bvxor(b),
            })
        }
    };
    Ok(from_bool(&predicate, size))
}

fn unary<'ctx>(op: UnaryOp, a: &BV<'ctx>, size: usize) -> Result<BV<'ctx>, SynthError> {
    let bits = (size * 8) as u32;
    let widen = |signed: bool| {
        if bits < a.get_size() {
            Err(SynthError::SizeMismatch(format!("extending {} bits to {}", a.get_size(), bits)))
        } else if signed {
            Ok(a.sign_ext(bits - a.get_size()))
        } else {
            Ok(a.zero_ext(bits - a.get_size()))
        }
    };
    match op {
        UnaryOp::IntNegate => Ok(a.bvnot()),
        UnaryOp::Int2Comp => Ok(a.bvneg()),
        UnaryOp::IntZExt => widen(false),
        UnaryOp::IntSExt => widen(true),
        UnaryOp::BoolNegate => Ok(a.bvxor(&BV::from_u64(a.get_ctx(), 1, a.get_size()))),
        UnaryOp::Popcount => {
            let width = a.get_size().max(bits);
            let total = (0..a.get_size())
                .map(|i| a.extract(i, i).zero_ext(width - 1))
                .reduce(|acc, bit| acc.bvadd(&bit))
                .ok_or_else(|| SynthError::SizeMismatch("popcount of nothing".into()))?;
            Ok(resize(&total, bits))
        }
    }
}

// Read every input, apply `f`, write the output.
fn pure_operation<'ctx, F>(
    state: &State<'ctx>,
    srcs: &[&VarNode],
    dst: &VarNode,
    effects: &mut Effects<'ctx>,
    f: F,
) -> Result<State<'ctx>, SynthError>
where
    F: Fn(&[BV<'ctx>]) -> Result<BV<'ctx>, SynthError>,
{
    let mut args = Vec::with_capacity(srcs.len());
    for src in srcs {
        effects.read(state, src);
        args.push(state.read(src)?);
    }
    let value = f(&args)?;
    if value.get_size() as usize != dst.size * 8 {
        return Err(SynthError::SizeMismatch(format!("result of {} bits for {}", value.get_size(), dst)));
    }
    effects.write(state, dst);
    state.write(dst, &value)
}

fn read_target<'ctx>(state: &State<'ctx>, vn: &VarNode, effects: &mut Effects<'ctx>) -> Result<BV<'ctx>, SynthError> {
    effects.read(state, vn);
    Ok(resize(&state.read(vn)?, ADDRESS_BITS))
}

/// Execute one operation.
///
/// `fallthrough` is the address following the instruction, used as the
/// not-taken target of conditional branches.
pub fn step<'ctx>(
    state: &State<'ctx>,
    op: &PcodeOp,
    fallthrough: u64,
    effects: &mut Effects<'ctx>,
) -> Result<State<'ctx>, SynthError> {
    let ctx = state.get_ctx();
    let transfer = |kind: TransferKind, target: BV<'ctx>| Some(ControlTransfer { kind, target });
    match op {
        PcodeOp::Copy { input, output } => pure_operation(state, &[input], output, effects, |x| Ok(x[0].clone())),
        PcodeOp::Binary { op, lhs, rhs, output } => {
            pure_operation(state, &[lhs, rhs], output, effects, |x| binary(*op, &x[0], &x[1], output.size))
        }
        PcodeOp::Unary { op, input, output } => {
            pure_operation(state, &[input], output, effects, |x| unary(*op, &x[0], output.size))
        }
        PcodeOp::SubPiece { input, offset, output } => pure_operation(state, &[input], output, effects, |x| {
            let bits = x[0].get_size();
            let low = (*offset * 8) as u32;
            if low >= bits {
                return Ok(constant(ctx, 0, output.size));
            }
            let high = (low + (output.size * 8) as u32).min(bits) - 1;
            Ok(resize(&x[0].extract(high, low), (output.size * 8) as u32))
        }),
        PcodeOp::Load { space, pointer, output } => {
            effects.read(state, pointer);
            let address = resize(&state.read(pointer)?, ADDRESS_BITS);
            let value = state.read_indirect(*space, &address, output.size)?;
            effects.inputs.push(ResolvedVarNode::Indirect(ResolvedIndirectVarNode {
                space: *space,
                pointer: address,
                access_size: output.size,
            }));
            effects.write(state, output);
            state.write(output, &value)
        }
        PcodeOp::Store { space, pointer, input } => {
            effects.read(state, pointer);
            effects.read(state, input);
            let address = resize(&state.read(pointer)?, ADDRESS_BITS);
            let value = state.read(input)?;
            effects.outputs.push(ResolvedVarNode::Indirect(ResolvedIndirectVarNode {
                space: *space,
                pointer: address.clone(),
                access_size: input.size,
            }));
            state.write_indirect(*space, &address, &value)
        }
        PcodeOp::Branch { target } => {
            effects.transfer = transfer(TransferKind::Branch, BV::from_u64(ctx, *target, ADDRESS_BITS));
            Ok(state.clone())
        }
        PcodeOp::Call { target } => {
            effects.transfer = transfer(TransferKind::Call, BV::from_u64(ctx, *target, ADDRESS_BITS));
            Ok(state.clone())
        }
        PcodeOp::CBranch { target, condition } => {
            effects.read(state, condition);
            let taken = to_bool(&state.read(condition)?);
            let target = taken.ite(
                &BV::from_u64(ctx, *target, ADDRESS_BITS),
                &BV::from_u64(ctx, fallthrough, ADDRESS_BITS),
            );
            effects.transfer = transfer(TransferKind::Conditional, target);
            Ok(state.clone())
        }
        PcodeOp::BranchInd { target } => {
            let target = read_target(state, target, effects)?;
            effects.transfer = transfer(TransferKind::Indirect, target);
            Ok(state.clone())
        }
        PcodeOp::CallInd { target } => {
            let target = read_target(state, target, effects)?;
            effects.transfer = transfer(TransferKind::IndirectCall, target);
            Ok(state.clone())
        }
        PcodeOp::Return { target } => {
            let target = read_target(state, target, effects)?;
            effects.transfer = transfer(TransferKind::Return, target);
            Ok(state.clone())
        }
        PcodeOp::CallOther { name, inputs, output } => {
            for input in inputs {
                effects.read(state, input);
            }
            effects.user_ops.push(name.clone());
            match output {
                // The result of a user operation is opaque but deterministic.
                Some(output) => {
                    let value = BV::new_const(
                        ctx,
                        format!("{}_{}_{}", name, state.generation().index(), effects.user_ops.len()),
                        (output.size * 8) as u32,
                    );
                    effects.write(state, output);
                    state.write(output, &value)
                }
                None => Ok(state.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        semantics::{x86::X86_64Semantics, InstructionSemantics},
        state::StateArena,
    };
    use z3::{Config, Context};

    fn run<'ctx>(state: &State<'ctx>, ops: &[PcodeOp]) -> (State<'ctx>, Effects<'ctx>) {
        let mut effects = Effects::new();
        let mut current = state.clone();
        for op in ops {
            current = step(&current, op, 0, &mut effects).unwrap();
        }
        (current, effects)
    }

    #[test]
    fn flags_of_subtraction() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let state = State::new(&ctx, sem.arch(), StateArena::new().fresh());
        // mov eax, 1; sub rax, 2
        let mov = sem.decode(&[0xb8, 1, 0, 0, 0], 0).unwrap();
        let sub = sem.decode(&[0x48, 0x83, 0xe8, 0x02], 5).unwrap();
        let (after, _) = run(&state, &[mov.ops, sub.ops].concat());
        let read = |name: &str| after.register(name).unwrap().simplify().as_u64();
        assert_eq!(read("RAX"), Some(u64::MAX));
        assert_eq!(read("CF"), Some(1));
        assert_eq!(read("SF"), Some(1));
        assert_eq!(read("ZF"), Some(0));
        assert_eq!(read("OF"), Some(0));
        // 0xff has eight set bits
        assert_eq!(read("PF"), Some(1));
    }

    #[test]
    fn flags_of_addition() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let state = State::new(&ctx, sem.arch(), StateArena::new().fresh());
        // mov eax, 0xf; add rax, 1
        let mov = sem.decode(&[0xb8, 0x0f, 0, 0, 0], 0).unwrap();
        let add = sem.decode(&[0x48, 0x83, 0xc0, 0x01], 5).unwrap();
        let (after, _) = run(&state, &[mov.ops.clone(), add.ops].concat());
        let read = |s: &State, name: &str| s.register(name).unwrap().simplify().as_u64();
        assert_eq!(read(&after, "RAX"), Some(0x10));
        assert_eq!(read(&after, "AF"), Some(1));
        assert_eq!(read(&after, "CF"), Some(0));
        // inc rax from 0x10 does not carry out of the low nibble
        let inc = sem.decode(&[0x48, 0xff, 0xc0], 9).unwrap();
        let (after, _) = run(&after, &inc.ops);
        assert_eq!(read(&after, "AF"), Some(0));
        // xor eax, eax
        let xor = sem.decode(&[0x31, 0xc0], 12).unwrap();
        let (after, _) = run(&after, &xor.ops);
        assert_eq!(read(&after, "AF"), Some(0));
        assert_eq!(read(&after, "ZF"), Some(1));
    }

    #[test]
    fn wide_shift_amounts_are_not_truncated() {
        let ctx = Context::new(&Config::new());
        let byte = |v: u64| BV::from_u64(&ctx, v, 8);
        let amount = BV::from_u64(&ctx, 256, 16);
        let eval = |op: BinaryOp, a| binary(op, &a, &amount, 1).unwrap().simplify().as_u64();
        assert_eq!(eval(BinaryOp::IntLeft, byte(1)), Some(0));
        assert_eq!(eval(BinaryOp::IntRight, byte(0x80)), Some(0));
        assert_eq!(eval(BinaryOp::IntSRight, byte(0x80)), Some(0xff));
        let small = binary(BinaryOp::IntLeft, &byte(1), &BV::from_u64(&ctx, 3, 16), 1).unwrap();
        assert_eq!(small.simplify().as_u64(), Some(8));
    }

    #[test]
    fn records_exposed_inputs_only() {
        let ctx = Context::new(&Config::new());
        let sem = X86_64Semantics::new();
        let state = State::new(&ctx, sem.arch(), StateArena::new().fresh());
        // mov eax, 5; mov rbx, rax; ret
        let ops = [
            sem.decode(&[0xb8, 5, 0, 0, 0], 0).unwrap().ops,
            sem.decode(&[0x48, 0x89, 0xc3], 5).unwrap().ops,
            sem.decode(&[0xc3], 8).unwrap().ops,
        ]
        .concat();
        let (_, effects) = run(&state, &ops);
        let rax = ResolvedVarNode::Direct(*sem.arch().register("RAX").unwrap());
        let rsp = ResolvedVarNode::Direct(*sem.arch().register("RSP").unwrap());
        assert!(!effects.inputs.contains(&rax));
        assert!(effects.inputs.contains(&rsp));
        assert!(effects.outputs.contains(&ResolvedVarNode::Direct(*sem.arch().register("RBX").unwrap())));
        assert_eq!(effects.transfer.map(|t| t.kind), Some(TransferKind::Return));
    }
}
