//! Bytecode opcodes
//!
//! A compact stack-machine instruction set. Operands are little-endian and
//! follow the opcode byte. Jump offsets are signed and relative to the end of
//! the jump instruction. Instructions that consult or record type feedback
//! carry a `u16` call-site id indexing the chunk's call-site table.

use crate::runtime::ops::{ArithOp, CompareOp};

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // ========== Stack Operations ==========
    /// No operation
    Nop = 0x00,
    /// Pop the top value from the stack
    Pop = 0x01,
    /// Duplicate the top value on the stack
    Dup = 0x02,
    /// Swap the top two values on the stack
    Swap = 0x03,

    // ========== Constants ==========
    /// Load a constant from the constant pool
    /// Operands: constant_index (u16)
    LoadConst = 0x10,
    /// Push undefined
    LoadUndefined = 0x11,
    /// Push null
    LoadNull = 0x12,
    /// Push true
    LoadTrue = 0x13,
    /// Push false
    LoadFalse = 0x14,

    // ========== Variables ==========
    /// Push a local (parameters occupy the first locals)
    /// Operands: local_index (u8)
    GetLocal = 0x20,
    /// Pop into a local
    /// Operands: local_index (u8)
    SetLocal = 0x21,
    /// Push a global
    /// Operands: name_index (u16)
    GetGlobal = 0x22,
    /// Pop into a global
    /// Operands: name_index (u16)
    SetGlobal = 0x23,

    // ========== Properties ==========
    /// Stack: [obj] -> [value]
    /// Operands: name_index (u16), site (u16)
    GetNamed = 0x30,
    /// Stack: [obj, value] -> []
    /// Operands: name_index (u16), site (u16)
    SetNamed = 0x31,
    /// Stack: [obj, value] -> [obj]
    /// Operands: name_index (u16)
    DefineNamed = 0x32,
    /// Stack: [array, index] -> [value]
    /// Operands: site (u16)
    LoadElement = 0x33,
    /// Stack: [array, index, value] -> []
    /// Operands: site (u16)
    StoreElement = 0x34,
    /// Push a fresh empty object
    CreateObject = 0x35,
    /// Push a holey array
    /// Operands: length (u8)
    NewArray = 0x36,

    // ========== Arithmetic ==========
    /// Operands: site (u16)
    Add = 0x40,
    /// Operands: site (u16)
    Sub = 0x41,
    /// Operands: site (u16)
    Mul = 0x42,
    /// Operands: site (u16)
    Div = 0x43,
    /// Operands: site (u16)
    Mod = 0x44,
    /// Negate a value
    Neg = 0x46,

    // ========== Comparison ==========
    /// Strict equal (===)
    StrictEq = 0x62,
    /// Strict not equal (!==)
    StrictNe = 0x63,
    /// Operands: site (u16)
    Lt = 0x64,
    /// Operands: site (u16)
    Le = 0x65,
    /// Operands: site (u16)
    Gt = 0x66,
    /// Operands: site (u16)
    Ge = 0x67,

    // ========== Logical ==========
    /// Logical NOT
    Not = 0x70,

    // ========== Control Flow ==========
    /// Operands: offset (i16)
    Jump = 0x90,
    /// Pop; jump if falsy
    /// Operands: offset (i16)
    JumpIfFalse = 0x91,
    /// Pop; jump if truthy
    /// Operands: offset (i16)
    JumpIfTrue = 0x92,

    // ========== Functions ==========
    /// Call a function through the dispatcher
    /// Operands: function_index (u16), arg_count (u8)
    Call = 0xA0,
    /// Return from function with value
    Return = 0xA1,
    /// Return undefined from function
    ReturnUndefined = 0xA2,

    // ========== Exceptions ==========
    /// Throw the popped value
    Throw = 0xD2,

    // ========== Host ==========
    /// Pop a value into the host's effect log
    Emit = 0xE0,

    // ========== Generators ==========
    /// Pop a value and suspend; the resume value is pushed on resumption
    Yield = 0xF8,
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::Pop),
            0x02 => Some(Opcode::Dup),
            0x03 => Some(Opcode::Swap),

            0x10 => Some(Opcode::LoadConst),
            0x11 => Some(Opcode::LoadUndefined),
            0x12 => Some(Opcode::LoadNull),
            0x13 => Some(Opcode::LoadTrue),
            0x14 => Some(Opcode::LoadFalse),

            0x20 => Some(Opcode::GetLocal),
            0x21 => Some(Opcode::SetLocal),
            0x22 => Some(Opcode::GetGlobal),
            0x23 => Some(Opcode::SetGlobal),

            0x30 => Some(Opcode::GetNamed),
            0x31 => Some(Opcode::SetNamed),
            0x32 => Some(Opcode::DefineNamed),
            0x33 => Some(Opcode::LoadElement),
            0x34 => Some(Opcode::StoreElement),
            0x35 => Some(Opcode::CreateObject),
            0x36 => Some(Opcode::NewArray),

            0x40 => Some(Opcode::Add),
            0x41 => Some(Opcode::Sub),
            0x42 => Some(Opcode::Mul),
            0x43 => Some(Opcode::Div),
            0x44 => Some(Opcode::Mod),
            0x46 => Some(Opcode::Neg),

            0x62 => Some(Opcode::StrictEq),
            0x63 => Some(Opcode::StrictNe),
            0x64 => Some(Opcode::Lt),
            0x65 => Some(Opcode::Le),
            0x66 => Some(Opcode::Gt),
            0x67 => Some(Opcode::Ge),

            0x70 => Some(Opcode::Not),

            0x90 => Some(Opcode::Jump),
            0x91 => Some(Opcode::JumpIfFalse),
            0x92 => Some(Opcode::JumpIfTrue),

            0xA0 => Some(Opcode::Call),
            0xA1 => Some(Opcode::Return),
            0xA2 => Some(Opcode::ReturnUndefined),

            0xD2 => Some(Opcode::Throw),
            0xE0 => Some(Opcode::Emit),
            0xF8 => Some(Opcode::Yield),

            _ => None,
        }
    }

    /// Get the size of the instruction including operands
    pub fn instruction_size(&self) -> usize {
        match self {
            // No operands
            Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Swap
            | Opcode::LoadUndefined
            | Opcode::LoadNull
            | Opcode::LoadTrue
            | Opcode::LoadFalse
            | Opcode::CreateObject
            | Opcode::Neg
            | Opcode::StrictEq
            | Opcode::StrictNe
            | Opcode::Not
            | Opcode::Return
            | Opcode::ReturnUndefined
            | Opcode::Throw
            | Opcode::Emit
            | Opcode::Yield => 1,

            // 1-byte operand
            Opcode::GetLocal | Opcode::SetLocal | Opcode::NewArray => 2,

            // 2-byte operand (constant index, site or jump offset)
            Opcode::LoadConst
            | Opcode::GetGlobal
            | Opcode::SetGlobal
            | Opcode::DefineNamed
            | Opcode::LoadElement
            | Opcode::StoreElement
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue => 3,

            // 3-byte operand (u16 + u8)
            Opcode::Call => 4,

            // 4-byte operand (name u16 + site u16)
            Opcode::GetNamed | Opcode::SetNamed => 5,
        }
    }
}

/// A decoded instruction; jump targets are absolute byte offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Pop,
    Dup,
    Swap,
    LoadConst(u16),
    LoadUndefined,
    LoadNull,
    LoadTrue,
    LoadFalse,
    GetLocal(u8),
    SetLocal(u8),
    GetGlobal(u16),
    SetGlobal(u16),
    GetNamed { name: u16, site: u16 },
    SetNamed { name: u16, site: u16 },
    DefineNamed(u16),
    LoadElement(u16),
    StoreElement(u16),
    CreateObject,
    NewArray(u8),
    Add(u16),
    Arith(ArithOp, u16),
    Neg,
    Compare(CompareOp, u16),
    StrictEq,
    StrictNe,
    Not,
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    Call { function: u16, argc: u8 },
    Return,
    ReturnUndefined,
    Throw,
    Emit,
    Yield,
}

impl Instruction {
    /// Values popped and pushed
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instruction::Nop => (0, 0),
            Instruction::Pop => (1, 0),
            Instruction::Dup => (1, 2),
            Instruction::Swap => (2, 2),
            Instruction::LoadConst(_)
            | Instruction::LoadUndefined
            | Instruction::LoadNull
            | Instruction::LoadTrue
            | Instruction::LoadFalse
            | Instruction::GetLocal(_)
            | Instruction::GetGlobal(_)
            | Instruction::CreateObject
            | Instruction::NewArray(_) => (0, 1),
            Instruction::SetLocal(_) | Instruction::SetGlobal(_) => (1, 0),
            Instruction::GetNamed { .. } => (1, 1),
            Instruction::SetNamed { .. } => (2, 0),
            Instruction::DefineNamed(_) => (2, 1),
            Instruction::LoadElement(_) => (2, 1),
            Instruction::StoreElement(_) => (3, 0),
            Instruction::Add(_)
            | Instruction::Arith(..)
            | Instruction::Compare(..)
            | Instruction::StrictEq
            | Instruction::StrictNe => (2, 1),
            Instruction::Neg | Instruction::Not => (1, 1),
            Instruction::Jump(_) => (0, 0),
            Instruction::JumpIfFalse(_) | Instruction::JumpIfTrue(_) => (1, 0),
            Instruction::Call { argc, .. } => (*argc as usize, 1),
            Instruction::Return | Instruction::Throw | Instruction::Emit => (1, 0),
            Instruction::ReturnUndefined => (0, 0),
            Instruction::Yield => (1, 1),
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump(_) | Instruction::Return | Instruction::ReturnUndefined | Instruction::Throw
        )
    }

    /// Branch target, if any
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) | Instruction::JumpIfTrue(t) => Some(*t),
            _ => None,
        }
    }

    /// Feedback slot this instruction records into
    pub fn site(&self) -> Option<u16> {
        match self {
            Instruction::GetNamed { site, .. }
            | Instruction::SetNamed { site, .. }
            | Instruction::LoadElement(site)
            | Instruction::StoreElement(site)
            | Instruction::Add(site)
            | Instruction::Arith(_, site)
            | Instruction::Compare(_, site) => Some(*site),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip_table() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
                assert!(op.instruction_size() >= 1);
            }
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Instruction::Call { function: 0, argc: 3 }.stack_effect(), (3, 1));
        assert_eq!(Instruction::StoreElement(0).stack_effect(), (3, 0));
        assert!(Instruction::Throw.is_terminator());
        assert!(!Instruction::JumpIfFalse(4).is_terminator());
    }
}
