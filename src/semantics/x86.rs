//! Built-in semantics for an integer subset of x86-64.
//!
//! Register offsets follow the Ghidra x86-64 register layout so raw p-code
//! written against that layout reads the same storage.

use std::sync::Arc;

use crate::{
    bytecode::{BinaryOp, Disassembly, Instruction, PcodeOp, UnaryOp, VarNode},
    error::LiftError,
    ty::{ArchInfo, RegisterInfo, SpaceIndex, SpaceInfo, SpaceKind},
};

use super::InstructionSemantics;

pub const LANGUAGE_ID: &str = "x86:LE:64:default";

const CONST: SpaceIndex = 0;
const RAM: SpaceIndex = 1;
const REGISTER: SpaceIndex = 2;
const UNIQUE: SpaceIndex = 3;

const RIP: u64 = 0x288;
const CF: u64 = 0x200;
const PF: u64 = 0x202;
const AF: u64 = 0x204;
const ZF: u64 = 0x206;
const SF: u64 = 0x207;
const DF: u64 = 0x20a;
const OF: u64 = 0x20b;

const RSP_INDEX: u8 = 4;
const MAX_INSTRUCTION_LENGTH: usize = 15;

const NAMES_64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];
const NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d", "r13d", "r14d",
    "r15d",
];
const NAMES_16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w", "r14w", "r15w",
];
const NAMES_8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];

fn gpr_offset(index: u8) -> u64 {
    if index < 8 {
        index as u64 * 8
    } else {
        0x80 + (index as u64 - 8) * 8
    }
}

fn reg_name(index: u8, size: usize) -> &'static str {
    let i = index as usize & 0xf;
    match size {
        8 => NAMES_64[i],
        4 => NAMES_32[i],
        2 => NAMES_16[i],
        _ => NAMES_8[i],
    }
}

fn x86_64_arch() -> ArchInfo {
    let spaces = vec![
        SpaceInfo { name: "const".into(), kind: SpaceKind::Constant },
        SpaceInfo { name: "ram".into(), kind: SpaceKind::Ram },
        SpaceInfo { name: "register".into(), kind: SpaceKind::Register },
        SpaceInfo { name: "unique".into(), kind: SpaceKind::Unique },
    ];
    let mut registers = Vec::new();
    for index in 0..16u8 {
        for (size, names) in [(8, &NAMES_64), (4, &NAMES_32), (2, &NAMES_16), (1, &NAMES_8)] {
            registers.push(RegisterInfo {
                name: names[index as usize].to_ascii_uppercase(),
                varnode: VarNode::new(REGISTER, gpr_offset(index), size),
                primary: size == 8,
                flag: false,
            });
        }
    }
    for (name, offset) in [("CF", CF), ("PF", PF), ("AF", AF), ("ZF", ZF), ("SF", SF), ("DF", DF), ("OF", OF)] {
        registers.push(RegisterInfo {
            name: name.into(),
            varnode: VarNode::new(REGISTER, offset, 1),
            primary: false,
            flag: true,
        });
    }
    registers.push(RegisterInfo {
        name: "RIP".into(),
        varnode: VarNode::new(REGISTER, RIP, 8),
        primary: false,
        flag: false,
    });
    ArchInfo::new(
        spaces,
        registers,
        VarNode::new(REGISTER, gpr_offset(RSP_INDEX), 8),
        VarNode::new(REGISTER, RIP, 8),
        false,
    )
}

#[derive(Debug, Clone)]
pub struct X86_64Semantics {
    arch: Arc<ArchInfo>,
}

impl X86_64Semantics {
    pub fn new() -> Self {
        Self { arch: Arc::new(x86_64_arch()) }
    }
}

impl Default for X86_64Semantics {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionSemantics for X86_64Semantics {
    fn arch(&self) -> &Arc<ArchInfo> {
        &self.arch
    }

    fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction, LiftError> {
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LENGTH)];
        Decoder::new(window, address).decode()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

#[derive(Clone, Copy, Debug)]
enum Operand {
    Reg(u8),
    Mem { base: u8, disp: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Alu::Add),
            1 => Some(Alu::Or),
            4 => Some(Alu::And),
            5 => Some(Alu::Sub),
            6 => Some(Alu::Xor),
            7 => Some(Alu::Cmp),
            _ => None,
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            Alu::Add => "add",
            Alu::Or => "or",
            Alu::And => "and",
            Alu::Sub => "sub",
            Alu::Xor => "xor",
            Alu::Cmp => "cmp",
        }
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    address: u64,
    rex: Rex,
    ops: Vec<PcodeOp>,
    next_unique: u64,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8], address: u64) -> Self {
        Self { bytes, pos: 0, address, rex: Rex::default(), ops: Vec::new(), next_unique: 0x1000 }
    }

    fn fail(&self, reason: &str) -> LiftError {
        let end = (self.pos + 1).min(self.bytes.len());
        LiftError::new(self.address, &self.bytes[..end], reason)
    }

    fn byte(&mut self) -> Result<u8, LiftError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| self.fail("truncated instruction"))?;
        self.pos += 1;
        Ok(b)
    }

    fn imm8(&mut self) -> Result<i64, LiftError> {
        Ok(self.byte()? as i8 as i64)
    }

    fn imm16(&mut self) -> Result<u64, LiftError> {
        let lo = self.byte()? as u64;
        let hi = self.byte()? as u64;
        Ok(lo | hi << 8)
    }

    fn imm32(&mut self) -> Result<i64, LiftError> {
        let mut v = 0u32;
        for i in 0..4 {
            v |= (self.byte()? as u32) << (8 * i);
        }
        Ok(v as i32 as i64)
    }

    fn imm64(&mut self) -> Result<u64, LiftError> {
        let mut v = 0u64;
        for i in 0..8 {
            v |= (self.byte()? as u64) << (8 * i);
        }
        Ok(v)
    }

    fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.pos as u64)
    }

    fn op_size(&self) -> usize {
        if self.rex.w {
            8
        } else {
            4
        }
    }

    fn reg(&self, index: u8, size: usize) -> VarNode {
        VarNode::new(REGISTER, gpr_offset(index), size)
    }

    fn flag(&self, offset: u64) -> VarNode {
        VarNode::new(REGISTER, offset, 1)
    }

    fn konst(&self, value: u64, size: usize) -> VarNode {
        let masked = if size >= 8 { value } else { value & ((1u64 << (size * 8)) - 1) };
        VarNode::new(CONST, masked, size)
    }

    fn temp(&mut self, size: usize) -> VarNode {
        let vn = VarNode::new(UNIQUE, self.next_unique, size);
        self.next_unique += 0x10;
        vn
    }

    fn rsp(&self) -> VarNode {
        self.reg(RSP_INDEX, 8)
    }

    fn emit(&mut self, op: PcodeOp) {
        self.ops.push(op);
    }

    fn binary(&mut self, op: BinaryOp, lhs: VarNode, rhs: VarNode, output: VarNode) {
        self.emit(PcodeOp::Binary { op, lhs, rhs, output });
    }

    fn copy(&mut self, input: VarNode, output: VarNode) {
        self.emit(PcodeOp::Copy { input, output });
    }

    /// Write a register the way x86-64 does: 32-bit writes clear the upper half.
    fn assign_reg(&mut self, index: u8, size: usize, value: VarNode) {
        if size == 4 {
            self.emit(PcodeOp::Unary { op: UnaryOp::IntZExt, input: value, output: self.reg(index, 8) });
        } else {
            self.copy(value, self.reg(index, size));
        }
    }

    fn modrm(&mut self) -> Result<(u8, u8, Operand), LiftError> {
        let m = self.byte()?;
        let mode = m >> 6;
        let digit = (m >> 3) & 7;
        let reg = digit | (self.rex.r as u8) << 3;
        let rm = m & 7;
        if mode == 3 {
            return Ok((reg, digit, Operand::Reg(rm | (self.rex.b as u8) << 3)));
        }
        let base = if rm == 4 {
            let sib = self.byte()?;
            let index = ((sib >> 3) & 7) | (self.rex.x as u8) << 3;
            if index != 4 {
                return Err(self.fail("scaled index addressing"));
            }
            let base = sib & 7;
            if base == 5 && mode == 0 {
                return Err(self.fail("absolute addressing"));
            }
            base | (self.rex.b as u8) << 3
        } else if rm == 5 && mode == 0 {
            return Err(self.fail("rip-relative addressing"));
        } else {
            rm | (self.rex.b as u8) << 3
        };
        let disp = match mode {
            1 => self.imm8()?,
            2 => self.imm32()?,
            _ => 0,
        };
        Ok((reg, digit, Operand::Mem { base, disp }))
    }

    fn effective_address(&mut self, base: u8, disp: i64) -> VarNode {
        let base = self.reg(base, 8);
        if disp == 0 {
            base
        } else {
            let out = self.temp(8);
            self.binary(BinaryOp::IntAdd, base, self.konst(disp as u64, 8), out);
            out
        }
    }

    fn describe(&self, operand: Operand, size: usize) -> String {
        match operand {
            Operand::Reg(r) => reg_name(r, size).to_string(),
            Operand::Mem { base, disp } => {
                let ptr = match size {
                    8 => "qword ptr ",
                    4 => "dword ptr ",
                    2 => "word ptr ",
                    _ => "byte ptr ",
                };
                match disp {
                    0 => format!("{}[{}]", ptr, reg_name(base, 8)),
                    d if d < 0 => format!("{}[{} - {:#x}]", ptr, reg_name(base, 8), -d),
                    d => format!("{}[{} + {:#x}]", ptr, reg_name(base, 8), d),
                }
            }
        }
    }

    fn result_flags(&mut self, result: VarNode) {
        let zero = self.konst(0, result.size);
        self.binary(BinaryOp::IntSLess, result, zero, self.flag(SF));
        self.binary(BinaryOp::IntEqual, result, zero, self.flag(ZF));
        let low = self.temp(1);
        self.emit(PcodeOp::SubPiece { input: result, offset: 0, output: low });
        let count = self.temp(1);
        self.emit(PcodeOp::Unary { op: UnaryOp::Popcount, input: low, output: count });
        let parity = self.temp(1);
        self.binary(BinaryOp::IntAnd, count, self.konst(1, 1), parity);
        self.binary(BinaryOp::IntEqual, parity, self.konst(0, 1), self.flag(PF));
    }

    // AF is the carry out of bit 3: bit 4 of `a ^ b ^ result`.
    fn adjust_flag(&mut self, a: VarNode, b: VarNode, result: VarNode) {
        let mixed = self.temp(a.size);
        self.binary(BinaryOp::IntXor, a, b, mixed);
        self.binary(BinaryOp::IntXor, mixed, result, mixed);
        let low = self.temp(1);
        self.emit(PcodeOp::SubPiece { input: mixed, offset: 0, output: low });
        let bit = self.temp(1);
        self.binary(BinaryOp::IntAnd, low, self.konst(0x10, 1), bit);
        self.binary(BinaryOp::IntNotEqual, bit, self.konst(0, 1), self.flag(AF));
    }

    /// Arithmetic with flags; `dest` is `None` for comparisons.
    fn alu(&mut self, alu: Alu, a: VarNode, b: VarNode, dest: Option<u8>) {
        let size = a.size;
        match alu {
            Alu::Add => {
                self.binary(BinaryOp::IntCarry, a, b, self.flag(CF));
                self.binary(BinaryOp::IntSCarry, a, b, self.flag(OF));
            }
            Alu::Sub | Alu::Cmp => {
                self.binary(BinaryOp::IntLess, a, b, self.flag(CF));
                self.binary(BinaryOp::IntSBorrow, a, b, self.flag(OF));
            }
            Alu::Or | Alu::And | Alu::Xor => {
                self.copy(self.konst(0, 1), self.flag(CF));
                self.copy(self.konst(0, 1), self.flag(OF));
            }
        }
        let op = match alu {
            Alu::Add => BinaryOp::IntAdd,
            Alu::Sub | Alu::Cmp => BinaryOp::IntSub,
            Alu::Or => BinaryOp::IntOr,
            Alu::And => BinaryOp::IntAnd,
            Alu::Xor => BinaryOp::IntXor,
        };
        let result = self.temp(size);
        self.binary(op, a, b, result);
        self.result_flags(result);
        match alu {
            Alu::Or | Alu::And | Alu::Xor => self.copy(self.konst(0, 1), self.flag(AF)),
            _ => self.adjust_flag(a, b, result),
        }
        if let Some(dest) = dest {
            self.assign_reg(dest, size, result);
        }
    }

    fn push_value(&mut self, value: VarNode) {
        let rsp = self.rsp();
        self.binary(BinaryOp::IntSub, rsp, self.konst(8, 8), rsp);
        self.emit(PcodeOp::Store { space: RAM, pointer: rsp, input: value });
    }

    fn pop_into(&mut self, output: VarNode) {
        let rsp = self.rsp();
        self.emit(PcodeOp::Load { space: RAM, pointer: rsp, output });
        self.binary(BinaryOp::IntAdd, rsp, self.konst(8, 8), rsp);
    }

    fn finish(self, mnemonic: &str, args: String) -> Instruction {
        Instruction {
            address: self.address,
            length: self.pos,
            disassembly: Disassembly { mnemonic: mnemonic.to_string(), args },
            ops: self.ops,
        }
    }

    fn decode(mut self) -> Result<Instruction, LiftError> {
        let mut opcode = self.byte()?;
        if (0x40..0x50).contains(&opcode) {
            self.rex = Rex {
                w: opcode & 8 != 0,
                r: opcode & 4 != 0,
                x: opcode & 2 != 0,
                b: opcode & 1 != 0,
            };
            opcode = self.byte()?;
        }
        let rex_b = (self.rex.b as u8) << 3;
        match opcode {
            0x50..=0x57 => {
                let r = (opcode - 0x50) | rex_b;
                let saved = self.temp(8);
                self.copy(self.reg(r, 8), saved);
                self.push_value(saved);
                Ok(self.finish("push", reg_name(r, 8).into()))
            }
            0x58..=0x5f => {
                let r = (opcode - 0x58) | rex_b;
                let loaded = self.temp(8);
                self.pop_into(loaded);
                self.copy(loaded, self.reg(r, 8));
                Ok(self.finish("pop", reg_name(r, 8).into()))
            }
            0x90 if !self.rex.b => Ok(self.finish("nop", String::new())),
            0xc3 => {
                let rip = VarNode::new(REGISTER, RIP, 8);
                self.pop_into(rip);
                self.emit(PcodeOp::Return { target: rip });
                Ok(self.finish("ret", String::new()))
            }
            0xc2 => {
                let extra = self.imm16()?;
                let rip = VarNode::new(REGISTER, RIP, 8);
                self.pop_into(rip);
                let rsp = self.rsp();
                self.binary(BinaryOp::IntAdd, rsp, self.konst(extra, 8), rsp);
                self.emit(PcodeOp::Return { target: rip });
                Ok(self.finish("ret", format!("{:#x}", extra)))
            }
            0xc9 => {
                let rsp = self.rsp();
                self.copy(self.reg(5, 8), rsp);
                let rbp = self.reg(5, 8);
                self.pop_into(rbp);
                Ok(self.finish("leave", String::new()))
            }
            0xb8..=0xbf => {
                let r = (opcode - 0xb8) | rex_b;
                if self.rex.w {
                    let value = self.imm64()?;
                    self.copy(self.konst(value, 8), self.reg(r, 8));
                    Ok(self.finish("movabs", format!("{}, {:#x}", reg_name(r, 8), value)))
                } else {
                    let value = self.imm32()? as u32 as u64;
                    self.assign_reg(r, 4, self.konst(value, 4));
                    Ok(self.finish("mov", format!("{}, {:#x}", reg_name(r, 4), value)))
                }
            }
            0xc7 => {
                let size = self.op_size();
                let (_, digit, operand) = self.modrm()?;
                if digit != 0 {
                    return Err(self.fail("unsupported 0xc7 extension"));
                }
                let value = self.imm32()? as u64;
                let value = self.konst(value, size);
                let text = format!("{}, {:#x}", self.describe(operand, size), value.offset);
                match operand {
                    Operand::Reg(r) => self.assign_reg(r, size, value),
                    Operand::Mem { base, disp } => {
                        let pointer = self.effective_address(base, disp);
                        self.emit(PcodeOp::Store { space: RAM, pointer, input: value });
                    }
                }
                Ok(self.finish("mov", text))
            }
            0x89 | 0x8b => {
                let size = self.op_size();
                let (reg, _, operand) = self.modrm()?;
                let to_memory = opcode == 0x89;
                let text = if to_memory {
                    format!("{}, {}", self.describe(operand, size), reg_name(reg, size))
                } else {
                    format!("{}, {}", reg_name(reg, size), self.describe(operand, size))
                };
                match (operand, to_memory) {
                    (Operand::Reg(rm), true) => self.assign_reg(rm, size, self.reg(reg, size)),
                    (Operand::Reg(rm), false) => self.assign_reg(reg, size, self.reg(rm, size)),
                    (Operand::Mem { base, disp }, true) => {
                        let pointer = self.effective_address(base, disp);
                        self.emit(PcodeOp::Store { space: RAM, pointer, input: self.reg(reg, size) });
                    }
                    (Operand::Mem { base, disp }, false) => {
                        let pointer = self.effective_address(base, disp);
                        let loaded = self.temp(size);
                        self.emit(PcodeOp::Load { space: RAM, pointer, output: loaded });
                        self.assign_reg(reg, size, loaded);
                    }
                }
                Ok(self.finish("mov", text))
            }
            0x01 | 0x03 | 0x09 | 0x0b | 0x21 | 0x23 | 0x29 | 0x2b | 0x31 | 0x33 | 0x39 | 0x3b => {
                let alu = match opcode & 0xf8 {
                    0x00 => Alu::Add,
                    0x08 => Alu::Or,
                    0x20 => Alu::And,
                    0x28 => Alu::Sub,
                    0x30 => Alu::Xor,
                    _ => Alu::Cmp,
                };
                let size = self.op_size();
                let (reg, _, operand) = self.modrm()?;
                let rm = match operand {
                    Operand::Reg(rm) => rm,
                    Operand::Mem { .. } => return Err(self.fail("memory operand in arithmetic")),
                };
                let (dest, src) = if opcode & 2 == 0 { (rm, reg) } else { (reg, rm) };
                let keep = if alu == Alu::Cmp { None } else { Some(dest) };
                self.alu(alu, self.reg(dest, size), self.reg(src, size), keep);
                Ok(self.finish(alu.mnemonic(), format!("{}, {}", reg_name(dest, size), reg_name(src, size))))
            }
            0x83 => {
                let size = self.op_size();
                let (_, digit, operand) = self.modrm()?;
                let alu = Alu::from_digit(digit).ok_or_else(|| self.fail("unsupported 0x83 extension"))?;
                let rm = match operand {
                    Operand::Reg(rm) => rm,
                    Operand::Mem { .. } => return Err(self.fail("memory operand in arithmetic")),
                };
                let imm = self.imm8()?;
                let keep = if alu == Alu::Cmp { None } else { Some(rm) };
                self.alu(alu, self.reg(rm, size), self.konst(imm as u64, size), keep);
                Ok(self.finish(alu.mnemonic(), format!("{}, {:#x}", reg_name(rm, size), imm)))
            }
            0xff => {
                let (_, digit, operand) = self.modrm()?;
                match digit {
                    0 | 1 => {
                        let size = self.op_size();
                        let rm = match operand {
                            Operand::Reg(rm) => rm,
                            Operand::Mem { .. } => return Err(self.fail("memory operand in inc/dec")),
                        };
                        let a = self.reg(rm, size);
                        let one = self.konst(1, size);
                        let (overflow, op, mnemonic) = if digit == 0 {
                            (BinaryOp::IntSCarry, BinaryOp::IntAdd, "inc")
                        } else {
                            (BinaryOp::IntSBorrow, BinaryOp::IntSub, "dec")
                        };
                        self.binary(overflow, a, one, self.flag(OF));
                        let result = self.temp(size);
                        self.binary(op, a, one, result);
                        self.result_flags(result);
                        self.adjust_flag(a, one, result);
                        self.assign_reg(rm, size, result);
                        Ok(self.finish(mnemonic, reg_name(rm, size).into()))
                    }
                    2 | 4 => {
                        let text = self.describe(operand, 8);
                        let target = match operand {
                            Operand::Reg(r) => {
                                let saved = self.temp(8);
                                self.copy(self.reg(r, 8), saved);
                                saved
                            }
                            Operand::Mem { base, disp } => {
                                let pointer = self.effective_address(base, disp);
                                let loaded = self.temp(8);
                                self.emit(PcodeOp::Load { space: RAM, pointer, output: loaded });
                                loaded
                            }
                        };
                        if digit == 2 {
                            let ret = self.konst(self.next_address(), 8);
                            self.push_value(ret);
                            self.emit(PcodeOp::CallInd { target });
                            Ok(self.finish("call", text))
                        } else {
                            self.emit(PcodeOp::BranchInd { target });
                            Ok(self.finish("jmp", text))
                        }
                    }
                    _ => Err(self.fail("unsupported 0xff extension")),
                }
            }
            0xe8 => {
                let rel = self.imm32()?;
                let next = self.next_address();
                let target = next.wrapping_add(rel as u64);
                let ret = self.konst(next, 8);
                self.push_value(ret);
                self.emit(PcodeOp::Call { target });
                Ok(self.finish("call", format!("{:#x}", target)))
            }
            0xe9 | 0xeb => {
                let rel = if opcode == 0xe9 { self.imm32()? } else { self.imm8()? };
                let target = self.next_address().wrapping_add(rel as u64);
                self.emit(PcodeOp::Branch { target });
                Ok(self.finish("jmp", format!("{:#x}", target)))
            }
            0x72 | 0x73 | 0x74 | 0x75 | 0x78 | 0x79 => {
                let rel = self.imm8()?;
                let target = self.next_address().wrapping_add(rel as u64);
                let (flag, negate, mnemonic) = match opcode {
                    0x72 => (CF, false, "jb"),
                    0x73 => (CF, true, "jae"),
                    0x74 => (ZF, false, "je"),
                    0x75 => (ZF, true, "jne"),
                    0x78 => (SF, false, "js"),
                    _ => (SF, true, "jns"),
                };
                let condition = if negate {
                    let out = self.temp(1);
                    self.emit(PcodeOp::Unary { op: UnaryOp::BoolNegate, input: self.flag(flag), output: out });
                    out
                } else {
                    self.flag(flag)
                };
                self.emit(PcodeOp::CBranch { target, condition });
                Ok(self.finish(mnemonic, format!("{:#x}", target)))
            }
            0x0f => match self.byte()? {
                0x05 => {
                    self.emit(PcodeOp::CallOther { name: "syscall".into(), inputs: vec![], output: None });
                    Ok(self.finish("syscall", String::new()))
                }
                _ => Err(self.fail("unsupported two-byte opcode")),
            },
            _ => Err(self.fail("unsupported opcode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Instruction {
        X86_64Semantics::new().decode(bytes, 0x401000).unwrap()
    }

    #[test]
    fn pop_and_ret() {
        let pop = decode(&[0x41, 0x5f]);
        assert_eq!(pop.disassembly.to_string(), "pop r15");
        assert_eq!(pop.length, 2);
        assert!(!pop.terminates_block());
        let ret = decode(&[0xc3]);
        assert!(ret.ends_with_indirect_transfer());
    }

    #[test]
    fn mov_immediate_forms() {
        let sext = decode(&[0x48, 0xc7, 0xc0, 0x3b, 0x00, 0x00, 0x00]);
        assert_eq!(sext.disassembly.to_string(), "mov rax, 0x3b");
        assert_eq!(sext.length, 7);
        let narrow = decode(&[0xbf, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(narrow.disassembly.to_string(), "mov edi, 0x10");
        assert!(matches!(narrow.ops[0], PcodeOp::Unary { op: UnaryOp::IntZExt, .. }));
        let wide = decode(&[0x48, 0xbe, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(wide.ops, vec![PcodeOp::Copy {
            input: VarNode::new(CONST, 0x0807060504030201, 8),
            output: VarNode::new(REGISTER, 0x30, 8),
        }]);
    }

    #[test]
    fn memory_operands() {
        let store = decode(&[0x48, 0x89, 0x47, 0x08]);
        assert_eq!(store.disassembly.to_string(), "mov qword ptr [rdi + 0x8], rax");
        assert!(store.ops.iter().any(|op| matches!(op, PcodeOp::Store { .. })));
        let load = decode(&[0x48, 0x8b, 0x04, 0x24]);
        assert_eq!(load.disassembly.to_string(), "mov rax, qword ptr [rsp]");
        assert!(decode_err(&[0x48, 0x8b, 0x05, 0, 0, 0, 0]));
    }

    fn decode_err(bytes: &[u8]) -> bool {
        X86_64Semantics::new().decode(bytes, 0).is_err()
    }

    #[test]
    fn xor_writes_flags() {
        let xor = decode(&[0x48, 0x31, 0xc0]);
        assert_eq!(xor.disassembly.to_string(), "xor rax, rax");
        let flags: Vec<_> = xor.ops.iter().filter_map(|op| op.output()).filter(|o| o.offset >= CF && o.offset <= OF).collect();
        assert_eq!(flags.len(), 6);
        assert!(flags.iter().any(|f| f.offset == AF));
    }

    #[test]
    fn control_transfers() {
        let jmp = decode(&[0xff, 0xe0]);
        assert_eq!(jmp.disassembly.to_string(), "jmp rax");
        assert!(jmp.ends_with_indirect_transfer());
        let call = decode(&[0x41, 0xff, 0xd3]);
        assert_eq!(call.disassembly.to_string(), "call r11");
        assert!(call.ends_with_indirect_transfer());
        let direct = decode(&[0xeb, 0x02]);
        assert_eq!(direct.ops, vec![PcodeOp::Branch { target: 0x401004 }]);
        let je = decode(&[0x74, 0x00]);
        assert!(je.has_conditional_branch());
        let syscall = decode(&[0x0f, 0x05]);
        assert_eq!(syscall.user_ops().count(), 1);
        assert!(!syscall.terminates_block());
    }

    #[test]
    fn undecodable_bytes_name_the_address() {
        let err = X86_64Semantics::new().decode(&[0x0f, 0x0b], 0x1234).unwrap_err();
        assert_eq!(err.address, 0x1234);
        assert_eq!(err.bytes, vec![0x0f, 0x0b]);
        assert!(X86_64Semantics::new().decode(&[0x48, 0xc7], 0).is_err());
    }
}
