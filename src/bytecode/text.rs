//! Parser for raw p-code listings.
//!
//! One operation per line, either `OUT = OPCODE in, in` or `OPCODE in, in`.
//! Operands are register names, constants written `0x3b:8`, or explicit
//! locations such as `ram[0x1000]:8`. Blank lines and `#` comments are ignored.

use crate::{
    bytecode::{BinaryOp, Disassembly, Instruction, PcodeOp, UnaryOp, VarNode},
    error::SynthError,
    ty::ArchInfo,
};

struct LineParser<'a> {
    arch: &'a ArchInfo,
    line: usize,
}

impl<'a> LineParser<'a> {
    fn error<S: Into<String>>(&self, reason: S) -> SynthError {
        SynthError::PcodeSyntax { line: self.line, reason: reason.into() }
    }

    fn number(&self, text: &str) -> Result<u64, SynthError> {
        let text = text.trim();
        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => text.parse::<u64>(),
        };
        parsed.map_err(|_| self.error(format!("invalid number `{}`", text)))
    }

    fn varnode(&self, text: &str) -> Result<VarNode, SynthError> {
        let text = text.trim();
        if let Some(open) = text.find('[') {
            let space_name = &text[..open];
            let space = self
                .arch
                .space_by_name(space_name)
                .ok_or_else(|| self.error(format!("unknown space `{}`", space_name)))?;
            let close = text[open..]
                .find(']')
                .map(|i| open + i)
                .ok_or_else(|| self.error("unterminated `[`"))?;
            let offset = self.number(&text[open + 1..close])?;
            let size = match text[close + 1..].strip_prefix(':') {
                Some(size) => self.number(size)? as usize,
                None => return Err(self.error(format!("missing size in `{}`", text))),
            };
            return Ok(VarNode::new(space, offset, size));
        }
        if text.starts_with(|c: char| c.is_ascii_digit()) {
            let (value, size) = text
                .split_once(':')
                .ok_or_else(|| self.error(format!("constant `{}` needs a size", text)))?;
            return Ok(VarNode::new(self.arch.const_space(), self.number(value)?, self.number(size)? as usize));
        }
        let (name, size) = match text.split_once(':') {
            Some((name, size)) => (name, Some(self.number(size)? as usize)),
            None => (text, None),
        };
        let mut vn = *self
            .arch
            .register(name)
            .ok_or_else(|| self.error(format!("unknown register `{}`", name)))?;
        if let Some(size) = size {
            vn.size = size;
        }
        Ok(vn)
    }

    fn expect_output(&self, output: Option<VarNode>, opcode: &str) -> Result<VarNode, SynthError> {
        output.ok_or_else(|| self.error(format!("{} needs an output", opcode)))
    }

    fn arity<'b>(&self, operands: &'b [&'b str], n: usize, opcode: &str) -> Result<&'b [&'b str], SynthError> {
        if operands.len() == n {
            Ok(operands)
        } else {
            Err(self.error(format!("{} takes {} operands, found {}", opcode, n, operands.len())))
        }
    }

    /// Split an optional leading space name off LOAD/STORE operands.
    fn memory_operands<'b>(&self, operands: &'b [&'b str], n: usize) -> (usize, &'b [&'b str]) {
        match operands.first().and_then(|first| self.arch.space_by_name(first.trim())) {
            Some(space) if operands.len() == n + 1 => (space, &operands[1..]),
            _ => (self.arch.ram_space(), operands),
        }
    }

    fn parse(&self, text: &str) -> Result<PcodeOp, SynthError> {
        let (output, rest) = match text.split_once('=') {
            Some((lhs, rhs)) => (Some(self.varnode(lhs)?), rhs.trim()),
            None => (None, text.trim()),
        };
        let (opcode, operand_text) = match rest.split_once(char::is_whitespace) {
            Some((opcode, operands)) => (opcode, operands.trim()),
            None => (rest, ""),
        };
        let operands: Vec<&str> = if operand_text.is_empty() {
            vec![]
        } else {
            operand_text.split(',').map(str::trim).collect()
        };
        let opcode = opcode.to_ascii_uppercase();

        if let Some(op) = binary_op(&opcode) {
            let args = self.arity(&operands, 2, &opcode)?;
            return Ok(PcodeOp::Binary {
                op,
                lhs: self.varnode(args[0])?,
                rhs: self.varnode(args[1])?,
                output: self.expect_output(output, &opcode)?,
            });
        }
        if let Some(op) = unary_op(&opcode) {
            let args = self.arity(&operands, 1, &opcode)?;
            return Ok(PcodeOp::Unary { op, input: self.varnode(args[0])?, output: self.expect_output(output, &opcode)? });
        }
        let op = match opcode.as_str() {
            "COPY" => {
                let args = self.arity(&operands, 1, &opcode)?;
                PcodeOp::Copy { input: self.varnode(args[0])?, output: self.expect_output(output, &opcode)? }
            }
            "LOAD" => {
                let (space, args) = self.memory_operands(&operands, 1);
                let args = self.arity(args, 1, &opcode)?;
                PcodeOp::Load { space, pointer: self.varnode(args[0])?, output: self.expect_output(output, &opcode)? }
            }
            "STORE" => {
                let (space, args) = self.memory_operands(&operands, 2);
                let args = self.arity(args, 2, &opcode)?;
                PcodeOp::Store { space, pointer: self.varnode(args[0])?, input: self.varnode(args[1])? }
            }
            "SUBPIECE" => {
                let args = self.arity(&operands, 2, &opcode)?;
                PcodeOp::SubPiece {
                    input: self.varnode(args[0])?,
                    offset: self.varnode(args[1])?.offset as usize,
                    output: self.expect_output(output, &opcode)?,
                }
            }
            "BRANCH" | "CALL" => {
                let args = self.arity(&operands, 1, &opcode)?;
                let target = self.varnode(args[0])?.offset;
                if opcode == "BRANCH" {
                    PcodeOp::Branch { target }
                } else {
                    PcodeOp::Call { target }
                }
            }
            "CBRANCH" => {
                let args = self.arity(&operands, 2, &opcode)?;
                PcodeOp::CBranch { target: self.varnode(args[0])?.offset, condition: self.varnode(args[1])? }
            }
            "BRANCHIND" | "CALLIND" | "RETURN" => {
                let args = self.arity(&operands, 1, &opcode)?;
                let target = self.varnode(args[0])?;
                match opcode.as_str() {
                    "BRANCHIND" => PcodeOp::BranchInd { target },
                    "CALLIND" => PcodeOp::CallInd { target },
                    _ => PcodeOp::Return { target },
                }
            }
            "CALLOTHER" => {
                let (name, inputs) = operands.split_first().ok_or_else(|| self.error("CALLOTHER needs a name"))?;
                PcodeOp::CallOther {
                    name: name.to_string(),
                    inputs: inputs.iter().map(|i| self.varnode(i)).collect::<Result<_, _>>()?,
                    output,
                }
            }
            other => return Err(self.error(format!("unknown opcode `{}`", other))),
        };
        if output.is_some() && op.output().is_none() {
            return Err(self.error(format!("{} has no output", opcode)));
        }
        Ok(op)
    }
}

fn binary_op(opcode: &str) -> Option<BinaryOp> {
    use BinaryOp::*;
    let op = match opcode {
        "INT_ADD" => IntAdd,
        "INT_SUB" => IntSub,
        "INT_MULT" => IntMult,
        "INT_DIV" => IntDiv,
        "INT_SDIV" => IntSDiv,
        "INT_REM" => IntRem,
        "INT_SREM" => IntSRem,
        "INT_AND" => IntAnd,
        "INT_OR" => IntOr,
        "INT_XOR" => IntXor,
        "INT_LEFT" => IntLeft,
        "INT_RIGHT" => IntRight,
        "INT_SRIGHT" => IntSRight,
        "INT_EQUAL" => IntEqual,
        "INT_NOTEQUAL" => IntNotEqual,
        "INT_LESS" => IntLess,
        "INT_SLESS" => IntSLess,
        "INT_LESSEQUAL" => IntLessEqual,
        "INT_SLESSEQUAL" => IntSLessEqual,
        "INT_CARRY" => IntCarry,
        "INT_SCARRY" => IntSCarry,
        "INT_SBORROW" => IntSBorrow,
        "BOOL_AND" => BoolAnd,
        "BOOL_OR" => BoolOr,
        "BOOL_XOR" => BoolXor,
        _ => return None,
    };
    Some(op)
}

fn unary_op(opcode: &str) -> Option<UnaryOp> {
    match opcode {
        "INT_NEGATE" => Some(UnaryOp::IntNegate),
        "INT_2COMP" => Some(UnaryOp::Int2Comp),
        "INT_ZEXT" => Some(UnaryOp::IntZExt),
        "INT_SEXT" => Some(UnaryOp::IntSExt),
        "BOOL_NEGATE" => Some(UnaryOp::BoolNegate),
        "POPCOUNT" => Some(UnaryOp::Popcount),
        _ => None,
    }
}

/// Parse a listing into one single-operation instruction per line.
///
/// Instructions are numbered by their position in the listing.
pub fn parse_program(text: &str, arch: &ArchInfo) -> Result<Vec<Instruction>, SynthError> {
    let mut instructions = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let parser = LineParser { arch, line: index + 1 };
        let op = parser.parse(line)?;
        instructions.push(Instruction {
            address: instructions.len() as u64,
            length: 1,
            disassembly: Disassembly { mnemonic: line.to_string(), args: String::new() },
            ops: vec![op],
        });
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantics::{x86::X86_64Semantics, InstructionSemantics};

    #[test]
    fn parses_register_and_constant_operands() {
        let sem = X86_64Semantics::new();
        let text = "EDI = COPY 0xdeadbeef:4\n# comment\n\nESI = COPY 0x40:4\nBRANCH 0xdeadbeef:8\n";
        let program = parse_program(text, sem.arch()).unwrap();
        assert_eq!(program.len(), 3);
        assert_eq!(program[0].ops[0], PcodeOp::Copy {
            input: VarNode::new(sem.arch().const_space(), 0xdeadbeef, 4),
            output: *sem.arch().register("EDI").unwrap(),
        });
        assert_eq!(program[2].ops[0], PcodeOp::Branch { target: 0xdeadbeef });
        assert_eq!(program[2].address, 2);
    }

    #[test]
    fn parses_memory_operations() {
        let sem = X86_64Semantics::new();
        let text = "unique[0x100]:8 = LOAD ram, RSP\nSTORE RDI, RAX\nRAX = INT_ADD RAX, 8:8";
        let program = parse_program(text, sem.arch()).unwrap();
        assert!(matches!(program[0].ops[0], PcodeOp::Load { space, .. } if space == sem.arch().ram_space()));
        assert!(matches!(program[1].ops[0], PcodeOp::Store { .. }));
        assert!(matches!(program[2].ops[0], PcodeOp::Binary { op: BinaryOp::IntAdd, .. }));
    }

    #[test]
    fn reports_line_numbers() {
        let sem = X86_64Semantics::new();
        match parse_program("RAX = COPY 1:8\nRAX = FROB RBX", sem.arch()) {
            Err(SynthError::PcodeSyntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other.map(|p| p.len())),
        }
        assert!(parse_program("BRANCHIND", sem.arch()).is_err());
        assert!(parse_program("RAX = NOPE:8", sem.arch()).is_err());
    }

    #[test]
    fn malformed_brackets_are_errors() {
        let sem = X86_64Semantics::new();
        for text in [
            "RAX = COPY a]b[",
            "RAX = COPY ram]0x10[:8",
            "RAX = COPY ram[0x10:8",
            "RAX = COPY ram[0x10]",
            "RAX = COPY ram[]:8",
            "RAX = COPY ram[0x10]]:8",
        ] {
            assert!(
                matches!(parse_program(text, sem.arch()), Err(SynthError::PcodeSyntax { line: 1, .. })),
                "{}",
                text
            );
        }
        assert!(parse_program("RAX = COPY ram[0x10]:8", sem.arch()).is_ok());
    }
}
