//! Optimized-tier IR
//!
//! The speculative compiler lowers bytecode to a flat register program.
//! Register numbering mirrors the interpreter frame: local `i` lives in
//! register `i`, operand-stack depth `d` in register `local_count + d`, and
//! fields of allocations removed by escape analysis get registers of their
//! own after that. Registers hold a [`Slot`] at run time, so a value may be
//! kept unboxed as an `i32` or `f64` between guards.
//!
//! Everything here is plain data and `Send`: units are built on the compile
//! thread and shipped back to the engine.

use super::deopt::DeoptReason;
use crate::engine::FunctionId;
use crate::runtime::ops::{ArithOp, CompareOp};
use crate::runtime::{ShapeId, Value};
use std::fmt;
use std::rc::Rc;

pub type Reg = u16;

/// Index into [`OptimizedUnit::guards`]
pub type GuardId = u32;

/// Index into [`OptimizedUnit::frame_states`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameStateId(pub u32);

/// A constant the compiler can embed
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
}

impl ConstValue {
    pub fn to_value(&self) -> Value {
        match self {
            ConstValue::Undefined => Value::Undefined,
            ConstValue::Null => Value::Null,
            ConstValue::Boolean(b) => Value::Boolean(*b),
            ConstValue::Number(n) => Value::Number(*n),
            ConstValue::String(s) => Value::String(Rc::from(s.as_str())),
        }
    }

    /// Primitive values only; heap values cannot leave the engine thread
    pub fn from_value(value: &Value) -> Option<ConstValue> {
        Some(match value {
            Value::Undefined => ConstValue::Undefined,
            Value::Null => ConstValue::Null,
            Value::Boolean(b) => ConstValue::Boolean(*b),
            Value::Number(n) => ConstValue::Number(*n),
            Value::String(s) => ConstValue::String(s.to_string()),
            _ => return None,
        })
    }
}

/// A register's run-time content
#[derive(Debug, Clone, Default)]
pub enum Slot {
    /// Never written; reading it for a live value is an invariant violation
    #[default]
    Empty,
    /// Unboxed small integer
    Int(i32),
    /// Unboxed double
    Float(f64),
    Tagged(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl FloatOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            FloatOp::Add => a + b,
            FloatOp::Sub => a - b,
            FloatOp::Mul => a * b,
            FloatOp::Div => a / b,
            FloatOp::Mod => a % b,
        }
    }

    pub fn from_arith(op: ArithOp) -> Self {
        match op {
            ArithOp::Sub => FloatOp::Sub,
            ArithOp::Mul => FloatOp::Mul,
            ArithOp::Div => FloatOp::Div,
            ArithOp::Mod => FloatOp::Mod,
        }
    }
}

/// Binary operations executed through the shared runtime semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericBinary {
    Add,
    Arith(ArithOp),
    Compare(CompareOp),
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericUnary {
    Neg,
    Not,
}

/// Result of a shape check in a polymorphic property load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Slot(usize),
    Missing,
}

/// What an element load does when it finds a hole or runs out of bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleMode {
    Deopt,
    Undefined,
}

/// Optimized instructions. Jump targets are instruction indices.
#[derive(Debug, Clone)]
pub enum OptInstr {
    Move { dst: Reg, src: Reg },
    LoadConst { dst: Reg, value: ConstValue },

    // ========== Guards ==========
    CheckSmi { reg: Reg, guard: GuardId },
    CheckNumber { reg: Reg, guard: GuardId },
    CheckString { reg: Reg, guard: GuardId },
    /// Lazy deopt point: the running code was invalidated during a call
    CheckCodeValid { guard: GuardId },
    /// Unconditional bail-out where feedback was missing
    Deopt { guard: GuardId, reason: DeoptReason },

    // ========== Specialized arithmetic ==========
    /// Overflow-checked `i32` arithmetic; `Mul` also fails on `-0`
    IntBinary { op: IntOp, dst: Reg, lhs: Reg, rhs: Reg, guard: GuardId },
    FloatBinary { op: FloatOp, dst: Reg, lhs: Reg, rhs: Reg },
    IntCompare { op: CompareOp, dst: Reg, lhs: Reg, rhs: Reg },
    FloatCompare { op: CompareOp, dst: Reg, lhs: Reg, rhs: Reg },
    StringConcat { dst: Reg, lhs: Reg, rhs: Reg },

    // ========== Generic operations ==========
    Binary { op: GenericBinary, dst: Reg, lhs: Reg, rhs: Reg },
    Unary { op: GenericUnary, dst: Reg, src: Reg },

    // ========== Properties ==========
    LoadField { dst: Reg, object: Reg, cases: Vec<(ShapeId, FieldAccess)>, guard: GuardId },
    StoreField { object: Reg, value: Reg, cases: Vec<(ShapeId, usize)>, guard: GuardId },
    ArrayLength { dst: Reg, array: Reg, guard: GuardId },
    GetNamed { dst: Reg, object: Reg, name: String },
    SetNamed { object: Reg, name: String, value: Reg },
    DefineNamed { object: Reg, name: String, value: Reg },
    LoadElement { dst: Reg, array: Reg, index: Reg, hole_mode: HoleMode, guard: GuardId },
    StoreElement { array: Reg, index: Reg, value: Reg, guard: GuardId },
    GenericLoadElement { dst: Reg, array: Reg, index: Reg },
    GenericStoreElement { array: Reg, index: Reg, value: Reg },
    CreateObject { dst: Reg },
    NewArray { dst: Reg, len: usize },

    // ========== Globals ==========
    GetGlobal { dst: Reg, name: String },
    /// A global folded to the value it held at compile time
    LoadGlobalConstant { dst: Reg, name: String, version: u32, value: ConstValue, guard: GuardId },
    SetGlobal { name: String, src: Reg },

    // ========== Control ==========
    Call { dst: Reg, function: FunctionId, args: Vec<Reg> },
    Emit { src: Reg },
    Throw { src: Reg },
    Return { src: Reg },
    ReturnUndefined,
    Jump { target: usize },
    Branch { cond: Reg, when: bool, target: usize },
    /// Generator yield: save the frame and return `value` to the caller
    Suspend { value: Reg, frame_state: FrameStateId },
}

/// Where a value lives when a frame is reconstructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameValue {
    Register(Reg),
    /// Not live; restored as `undefined`
    Dead,
    /// An elided allocation, index into [`FrameState::objects`]
    Object(u32),
}

/// An allocation removed by escape analysis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectDesc {
    /// Properties in definition order
    pub fields: Vec<(String, FrameValue)>,
}

/// Interpreter frame layout at a bytecode offset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameState {
    pub bytecode_offset: usize,
    pub locals: Vec<FrameValue>,
    pub stack: Vec<FrameValue>,
    pub objects: Vec<ObjectDesc>,
}

impl FrameState {
    /// Number of entries, nested objects included
    pub fn size(&self) -> usize {
        self.locals.len() + self.stack.len() + self.objects.iter().map(|o| o.fields.len() + 1).sum::<usize>()
    }
}

/// Metadata of one guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardInfo {
    pub frame_state: FrameStateId,
    /// Feedback site the speculation came from
    pub site: Option<u16>,
    /// Offset of the protected bytecode
    pub bytecode_offset: usize,
}

/// The compiler's output
#[derive(Debug, Clone)]
pub struct OptimizedUnit {
    pub function: FunctionId,
    pub name: String,
    pub bytecode_version: u32,
    pub code: Vec<OptInstr>,
    pub guards: Vec<GuardInfo>,
    pub frame_states: Vec<FrameState>,
    pub register_count: usize,
    pub param_count: usize,
    pub local_count: usize,
    /// Globals folded to constants, with the cell version they were read at
    pub global_dependencies: Vec<(String, u32)>,
}

impl OptimizedUnit {
    pub fn guard(&self, id: GuardId) -> Option<&GuardInfo> {
        self.guards.get(id as usize)
    }

    pub fn frame_state(&self, id: FrameStateId) -> Option<&FrameState> {
        self.frame_states.get(id.0 as usize)
    }

    /// Total size of the frame-state table
    pub fn frame_state_size(&self) -> usize {
        self.frame_states.iter().map(FrameState::size).sum()
    }
}

impl fmt::Display for OptimizedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "== {} (optimized, {} registers, {} guards, {} frame states) ==",
            self.name,
            self.register_count,
            self.guards.len(),
            self.frame_states.len()
        )?;
        for (i, instr) in self.code.iter().enumerate() {
            writeln!(f, "{:04} {:?}", i, instr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_values() {
        assert_eq!(ConstValue::from_value(&Value::Number(2.5)), Some(ConstValue::Number(2.5)));
        assert_eq!(ConstValue::String("a".into()).to_value(), Value::string("a"));
        let arr = Value::new_array(crate::runtime::JsArray::default());
        assert_eq!(ConstValue::from_value(&arr), None);
    }

    #[test]
    fn test_frame_state_size() {
        let state = FrameState {
            bytecode_offset: 0,
            locals: vec![FrameValue::Register(0), FrameValue::Dead],
            stack: vec![FrameValue::Object(0)],
            objects: vec![ObjectDesc {
                fields: vec![("x".into(), FrameValue::Register(3))],
            }],
        };
        assert_eq!(state.size(), 5);
    }
}
