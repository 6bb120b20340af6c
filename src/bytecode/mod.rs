//! Bytecode representation and instruction set
//!
//! A [`Chunk`] is the opaque unit handed to the engine by an external
//! bytecode producer: the instruction bytes, a constant pool and the
//! call-site table that feedback is keyed by. Chunks are immutable once
//! built and are shared with the compile thread through an `Arc`, so they
//! hold only `Send` data.

mod builder;
mod opcode;
pub mod analysis;

pub use builder::{ChunkBuilder, Label};
pub use opcode::{Instruction, Opcode};

use crate::error::{Error, Result};
use crate::runtime::ops::{ArithOp, CompareOp};
use crate::runtime::{format_number, Value};
use bitflags::bitflags;
use std::fmt;
use std::rc::Rc;

bitflags! {
    /// Per-chunk properties set by the bytecode producer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChunkFlags: u8 {
        /// Calling the function creates a generator object
        const GENERATOR = 0b0000_0001;
        /// The body contains a construct the optimizing tier declines
        const UNSUPPORTED_CONSTRUCT = 0b0000_0010;
        /// Strict-mode code
        const STRICT = 0b0000_0100;
    }
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(String),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Number(n) => Value::Number(*n),
            Constant::String(s) => Value::String(Rc::from(s.as_str())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(s) => Some(s),
            Constant::Number(_) => None,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Number(n) => write!(f, "{}", format_number(*n)),
            Constant::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// What a call site observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// `+`, `-`, `*`, `/`, `%`
    BinaryOp,
    /// `<`, `<=`, `>`, `>=`
    Compare,
    /// `obj.name`
    NamedLoad,
    /// `obj.name = v`
    NamedStore,
    /// `arr[i]`
    ElementLoad,
    /// `arr[i] = v`
    ElementStore,
}

/// Entry of the call-site table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub kind: SiteKind,
    /// Offset of the instruction that owns the site
    pub offset: usize,
}

/// A compiled function body
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Function name for diagnostics
    pub name: String,
    /// Bytecode instructions
    pub code: Vec<u8>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Number of parameters; parameters are locals `0..param_count`
    pub param_count: u8,
    /// Number of locals, parameters included
    pub local_count: u8,
    /// Call-site table
    pub call_sites: Vec<CallSite>,
    pub flags: ChunkFlags,
}

impl Chunk {
    /// Create a new empty chunk
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(ChunkFlags::GENERATOR)
    }

    /// Get a constant from the pool
    pub fn get_constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// A constant that must be a string (property and global names)
    pub fn name_at(&self, index: u16, offset: usize) -> Result<&str> {
        self.get_constant(index)
            .and_then(Constant::as_str)
            .ok_or_else(|| Error::malformed(offset, format!("constant {} is not a name", index)))
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.code
            .get(offset)
            .copied()
            .ok_or_else(|| Error::malformed(offset, "truncated operand"))
    }

    fn read_u16(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes([self.read_u8(offset)?, self.read_u8(offset + 1)?]))
    }

    fn read_jump(&self, offset: usize) -> Result<usize> {
        let rel = i16::from_le_bytes([self.read_u8(offset + 1)?, self.read_u8(offset + 2)?]);
        let target = offset as i64 + 3 + rel as i64;
        if target < 0 || target as usize > self.code.len() {
            return Err(Error::malformed(offset, format!("jump target {} out of range", target)));
        }
        Ok(target as usize)
    }

    /// Decode the instruction at `offset`, returning it with the offset of the next one
    pub fn decode(&self, offset: usize) -> Result<(Instruction, usize)> {
        let byte = self.read_u8(offset)?;
        let opcode = Opcode::from_u8(byte)
            .ok_or_else(|| Error::malformed(offset, format!("unknown opcode 0x{:02x}", byte)))?;
        let next = offset + opcode.instruction_size();
        if next > self.code.len() {
            return Err(Error::malformed(offset, "truncated instruction"));
        }
        let instruction = match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::Pop => Instruction::Pop,
            Opcode::Dup => Instruction::Dup,
            Opcode::Swap => Instruction::Swap,
            Opcode::LoadConst => Instruction::LoadConst(self.read_u16(offset + 1)?),
            Opcode::LoadUndefined => Instruction::LoadUndefined,
            Opcode::LoadNull => Instruction::LoadNull,
            Opcode::LoadTrue => Instruction::LoadTrue,
            Opcode::LoadFalse => Instruction::LoadFalse,
            Opcode::GetLocal => Instruction::GetLocal(self.read_u8(offset + 1)?),
            Opcode::SetLocal => Instruction::SetLocal(self.read_u8(offset + 1)?),
            Opcode::GetGlobal => Instruction::GetGlobal(self.read_u16(offset + 1)?),
            Opcode::SetGlobal => Instruction::SetGlobal(self.read_u16(offset + 1)?),
            Opcode::GetNamed => Instruction::GetNamed {
                name: self.read_u16(offset + 1)?,
                site: self.read_u16(offset + 3)?,
            },
            Opcode::SetNamed => Instruction::SetNamed {
                name: self.read_u16(offset + 1)?,
                site: self.read_u16(offset + 3)?,
            },
            Opcode::DefineNamed => Instruction::DefineNamed(self.read_u16(offset + 1)?),
            Opcode::LoadElement => Instruction::LoadElement(self.read_u16(offset + 1)?),
            Opcode::StoreElement => Instruction::StoreElement(self.read_u16(offset + 1)?),
            Opcode::CreateObject => Instruction::CreateObject,
            Opcode::NewArray => Instruction::NewArray(self.read_u8(offset + 1)?),
            Opcode::Add => Instruction::Add(self.read_u16(offset + 1)?),
            Opcode::Sub => Instruction::Arith(ArithOp::Sub, self.read_u16(offset + 1)?),
            Opcode::Mul => Instruction::Arith(ArithOp::Mul, self.read_u16(offset + 1)?),
            Opcode::Div => Instruction::Arith(ArithOp::Div, self.read_u16(offset + 1)?),
            Opcode::Mod => Instruction::Arith(ArithOp::Mod, self.read_u16(offset + 1)?),
            Opcode::Neg => Instruction::Neg,
            Opcode::StrictEq => Instruction::StrictEq,
            Opcode::StrictNe => Instruction::StrictNe,
            Opcode::Lt => Instruction::Compare(CompareOp::Lt, self.read_u16(offset + 1)?),
            Opcode::Le => Instruction::Compare(CompareOp::Le, self.read_u16(offset + 1)?),
            Opcode::Gt => Instruction::Compare(CompareOp::Gt, self.read_u16(offset + 1)?),
            Opcode::Ge => Instruction::Compare(CompareOp::Ge, self.read_u16(offset + 1)?),
            Opcode::Not => Instruction::Not,
            Opcode::Jump => Instruction::Jump(self.read_jump(offset)?),
            Opcode::JumpIfFalse => Instruction::JumpIfFalse(self.read_jump(offset)?),
            Opcode::JumpIfTrue => Instruction::JumpIfTrue(self.read_jump(offset)?),
            Opcode::Call => Instruction::Call {
                function: self.read_u16(offset + 1)?,
                argc: self.read_u8(offset + 3)?,
            },
            Opcode::Return => Instruction::Return,
            Opcode::ReturnUndefined => Instruction::ReturnUndefined,
            Opcode::Throw => Instruction::Throw,
            Opcode::Emit => Instruction::Emit,
            Opcode::Yield => Instruction::Yield,
        };
        if let Some(site) = instruction.site() {
            if site as usize >= self.call_sites.len() {
                return Err(Error::malformed(offset, format!("call site {} not in table", site)));
            }
        }
        Ok((instruction, next))
    }

    /// Decode the whole chunk
    pub fn instructions(&self) -> Result<Vec<(usize, Instruction)>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let (instruction, next) = self.decode(offset)?;
            out.push((offset, instruction));
            offset = next;
        }
        Ok(out)
    }

    /// Disassemble the chunk for debugging
    pub fn disassemble(&self) -> String {
        let mut output = format!("== {} ==\n", self.name);
        let mut offset = 0;
        while offset < self.code.len() {
            match self.decode(offset) {
                Ok((instruction, next)) => {
                    output.push_str(&format!("{:04} {}\n", offset, self.describe(&instruction)));
                    offset = next;
                }
                Err(e) => {
                    output.push_str(&format!("{:04} <{}>\n", offset, e));
                    break;
                }
            }
        }
        output
    }

    fn describe(&self, instruction: &Instruction) -> String {
        let constant = |i: u16| {
            self.get_constant(i)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string())
        };
        match instruction {
            Instruction::LoadConst(i) => format!("LoadConst {} ({})", i, constant(*i)),
            Instruction::GetGlobal(i) => format!("GetGlobal {}", constant(*i)),
            Instruction::SetGlobal(i) => format!("SetGlobal {}", constant(*i)),
            Instruction::GetNamed { name, site } => format!("GetNamed {} [site {}]", constant(*name), site),
            Instruction::SetNamed { name, site } => format!("SetNamed {} [site {}]", constant(*name), site),
            Instruction::DefineNamed(name) => format!("DefineNamed {}", constant(*name)),
            Instruction::Jump(t) => format!("Jump -> {}", t),
            Instruction::JumpIfFalse(t) => format!("JumpIfFalse -> {}", t),
            Instruction::JumpIfTrue(t) => format!("JumpIfTrue -> {}", t),
            Instruction::Call { function, argc } => format!("Call f{} args={}", function, argc),
            other => format!("{:?}", other),
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_and_disassemble() {
        let mut b = ChunkBuilder::new("add", 2);
        b.get_local(0);
        b.get_local(1);
        b.add();
        b.ret();
        let chunk = b.finish().unwrap();

        let instructions = chunk.instructions().unwrap();
        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[2].1, Instruction::Add(0));
        assert_eq!(chunk.call_sites[0].kind, SiteKind::BinaryOp);
        assert_eq!(chunk.call_sites[0].offset, 4);

        let text = chunk.disassemble();
        assert!(text.contains("== add =="));
        assert!(text.contains("Add(0)"));
    }

    #[test]
    fn test_malformed_bytecode() {
        let mut chunk = Chunk::new("bad");
        chunk.code = vec![0xEE];
        let err = chunk.decode(0).unwrap_err();
        assert!(err.is_fatal());

        chunk.code = vec![Opcode::LoadConst as u8, 0x01];
        assert!(chunk.decode(0).is_err());

        chunk.code = vec![Opcode::Add as u8, 0x05, 0x00];
        let err = chunk.decode(0).unwrap_err();
        assert!(err.to_string().contains("call site 5"));
    }
}
