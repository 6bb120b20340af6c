//! Bytecode to optimized IR
//!
//! One pass over the reachable instructions. The interpreter frame maps
//! directly onto registers, so most stack traffic becomes either nothing or
//! a `Move`. Speculation follows the feedback snapshot:
//!
//! | site                  | feedback              | lowering                             |
//! |-----------------------|-----------------------|--------------------------------------|
//! | `+ - *`               | all Smi               | `CheckSmi` x2, `IntBinary`           |
//! | arithmetic, compare   | all numbers           | `CheckNumber` x2, float op           |
//! | `+`                   | all String            | `CheckString` x2, `StringConcat`     |
//! | `<` and friends       | all Smi               | `CheckSmi` x2, `IntCompare`          |
//! | `o.x`                 | objects, <= N shapes  | `LoadField` over the shape cases     |
//! | `a.length`            | all Array             | `ArrayLength`                        |
//! | `o.x = v`             | objects, field hits   | `StoreField`                         |
//! | `a[i]`, `a[i] = v`    | Array, Smi index      | `CheckSmi`, `LoadElement`/`StoreElement` |
//! | any site              | uninitialized         | `Deopt`                              |
//!
//! Everything else goes through the generic runtime operations.

use super::escape::{AbstractState, AbstractValue, AllocId, EscapeAnalysis};
use super::{CompileFailure, CompileRequest};
use crate::bytecode::analysis::{BytecodeAnalysis, LocalSet};
use crate::bytecode::{Chunk, Constant, Instruction};
use crate::engine::FunctionId;
use crate::jit::deopt::DeoptReason;
use crate::jit::feedback::{Cardinality, FeedbackSlot, Kind, PropertyHandler};
use crate::jit::ir::{
    ConstValue, FieldAccess, FloatOp, FrameState, FrameStateId, FrameValue, GenericBinary, GenericUnary, GuardId,
    GuardInfo, HoleMode, IntOp, ObjectDesc, OptInstr, OptimizedUnit, Reg,
};
use crate::runtime::ops::ArithOp;
use rustc_hash::FxHashMap as HashMap;

/// How a binary site is specialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speculation {
    NoFeedback,
    Smi,
    Number,
    String,
    Generic,
}

fn speculate(slot: Option<&FeedbackSlot>, allow_smi: bool, allow_string: bool) -> Speculation {
    let Some(slot) = slot else {
        return Speculation::Generic;
    };
    match slot.cardinality() {
        Cardinality::Uninitialized => Speculation::NoFeedback,
        Cardinality::Megamorphic => Speculation::Generic,
        _ if allow_smi && slot.all_kinds(|k| *k == Kind::Smi) => Speculation::Smi,
        _ if slot.all_kinds(Kind::is_number) => Speculation::Number,
        _ if allow_string && slot.all_kinds(|k| *k == Kind::String) => Speculation::String,
        _ => Speculation::Generic,
    }
}

pub(super) fn lower(
    request: &CompileRequest,
    analysis: &BytecodeAnalysis,
    escape: &EscapeAnalysis,
) -> Result<OptimizedUnit, CompileFailure> {
    let chunk: &Chunk = &request.chunk;
    let local_count = chunk.local_count as usize;
    let scratch = local_count + analysis.max_stack;
    let mut field_regs = HashMap::default();
    for (i, key) in escape.virtual_fields().into_iter().enumerate() {
        field_regs.insert(key, to_reg(scratch + 1 + i)?);
    }
    let register_count = scratch + 1 + field_regs.len();
    to_reg(register_count)?;

    let mut lowering = Lowering {
        request,
        chunk,
        analysis,
        escape,
        local_count,
        scratch: to_reg(scratch)?,
        field_regs,
        code: Vec::new(),
        guards: Vec::new(),
        frame_states: Vec::new(),
        interned: HashMap::default(),
        starts: vec![0; analysis.instructions.len()],
        fixups: Vec::new(),
        global_dependencies: Vec::new(),
        current_guard: None,
    };

    for index in 0..analysis.instructions.len() {
        lowering.starts[index] = lowering.code.len();
        lowering.current_guard = None;
        if let Some(state) = escape.entry(index) {
            lowering.instruction(index, state)?;
        }
    }
    // falling off the end returns undefined
    let end = lowering.code.len();
    lowering.code.push(OptInstr::ReturnUndefined);
    lowering.patch_jumps(end)?;

    Ok(OptimizedUnit {
        function: request.function,
        name: chunk.name.clone(),
        bytecode_version: request.bytecode_version,
        code: lowering.code,
        guards: lowering.guards,
        frame_states: lowering.frame_states,
        register_count,
        param_count: chunk.param_count as usize,
        local_count,
        global_dependencies: lowering.global_dependencies,
    })
}

fn to_reg(n: usize) -> Result<Reg, CompileFailure> {
    Reg::try_from(n).map_err(|_| CompileFailure::TooManyRegisters(n))
}

struct Lowering<'a> {
    request: &'a CompileRequest,
    chunk: &'a Chunk,
    analysis: &'a BytecodeAnalysis,
    escape: &'a EscapeAnalysis,
    local_count: usize,
    scratch: Reg,
    field_regs: HashMap<(AllocId, String), Reg>,
    code: Vec<OptInstr>,
    guards: Vec<GuardInfo>,
    frame_states: Vec<FrameState>,
    interned: HashMap<FrameState, FrameStateId>,
    /// First IR instruction of each bytecode instruction
    starts: Vec<usize>,
    /// (IR index of a jump, bytecode target offset)
    fixups: Vec<(usize, usize)>,
    global_dependencies: Vec<(String, u32)>,
    /// Entry guard of the instruction being lowered, created on demand
    current_guard: Option<GuardId>,
}

impl<'a> Lowering<'a> {
    fn emit(&mut self, instr: OptInstr) {
        self.code.push(instr);
    }

    fn local(&self, l: u8) -> Reg {
        l as Reg
    }

    fn stack(&self, depth: usize) -> Reg {
        (self.local_count + depth) as Reg
    }

    fn field_reg(&self, alloc: AllocId, name: &str) -> Result<Reg, CompileFailure> {
        self.field_regs
            .get(&(alloc, name.to_string()))
            .copied()
            .ok_or_else(|| CompileFailure::Internal(format!("no register for field {} of allocation {}", name, alloc)))
    }

    /// Register of a stack slot that must hold a real value
    fn value_at(&self, state: &AbstractState, depth: usize) -> Result<Reg, CompileFailure> {
        match state.stack.get(depth) {
            Some(AbstractValue::Unknown) => Ok(self.stack(depth)),
            Some(AbstractValue::Alloc(s)) => Err(CompileFailure::Internal(format!(
                "elided allocation {} used as a value",
                s
            ))),
            None => Err(CompileFailure::Internal(format!("stack slot {} out of range", depth))),
        }
    }

    fn name(&self, index: u16, offset: usize) -> Result<String, CompileFailure> {
        self.chunk
            .name_at(index, offset)
            .map(str::to_string)
            .map_err(|e| CompileFailure::InvalidBytecode(e.to_string()))
    }

    // ========== Frame states ==========

    fn intern(&mut self, state: FrameState) -> FrameStateId {
        if let Some(id) = self.interned.get(&state) {
            return *id;
        }
        let id = FrameStateId(self.frame_states.len() as u32);
        self.frame_states.push(state.clone());
        self.interned.insert(state, id);
        id
    }

    fn frame_state(&mut self, offset: usize, state: &AbstractState, live: &LocalSet, stack_len: usize) -> FrameStateId {
        let mut describer = Describer {
            state,
            escape: self.escape,
            field_regs: &self.field_regs,
            objects: Vec::new(),
            index: HashMap::default(),
        };
        let locals = (0..self.local_count)
            .map(|l| {
                if live.contains(l as u8) {
                    describer.value(state.locals[l], l as Reg)
                } else {
                    FrameValue::Dead
                }
            })
            .collect();
        let stack = (0..stack_len)
            .map(|d| describer.value(state.stack[d], (self.local_count + d) as Reg))
            .collect();
        let objects = describer.objects;
        self.intern(FrameState {
            bytecode_offset: offset,
            locals,
            stack,
            objects,
        })
    }

    /// Guard that resumes the interpreter at the start of instruction `index`
    fn guard(&mut self, index: usize, state: &AbstractState, site: Option<u16>) -> GuardId {
        if let Some(guard) = self.current_guard {
            return guard;
        }
        let offset = self.analysis.instructions[index].0;
        let live = self.analysis.live_at(index).clone();
        let frame_state = self.frame_state(offset, state, &live, state.stack.len());
        let id = self.add_guard(frame_state, site, offset);
        self.current_guard = Some(id);
        id
    }

    fn add_guard(&mut self, frame_state: FrameStateId, site: Option<u16>, offset: usize) -> GuardId {
        let id = self.guards.len() as GuardId;
        self.guards.push(GuardInfo {
            frame_state,
            site,
            bytecode_offset: offset,
        });
        id
    }

    /// Frame state right after instruction `index`, dropping `drop` stack slots
    fn frame_state_after(&mut self, index: usize, drop: usize) -> Result<FrameStateId, CompileFailure> {
        let state = self
            .escape
            .exit(index)
            .cloned()
            .ok_or_else(|| CompileFailure::Internal(format!("no exit state for instruction {}", index)))?;
        let (offset, live) = match self.analysis.instructions.get(index + 1) {
            Some((offset, _)) => (*offset, self.analysis.live_at(index + 1).clone()),
            None => (self.chunk.code.len(), LocalSet::default()),
        };
        let stack_len = state.stack.len().saturating_sub(drop);
        Ok(self.frame_state(offset, &state, &live, stack_len))
    }

    fn patch_jumps(&mut self, end: usize) -> Result<(), CompileFailure> {
        for (at, offset) in std::mem::take(&mut self.fixups) {
            let target = if offset >= self.chunk.code.len() {
                end
            } else {
                let index = self
                    .analysis
                    .index_of(offset)
                    .ok_or_else(|| CompileFailure::Internal(format!("jump to unknown offset {}", offset)))?;
                self.starts[index]
            };
            match &mut self.code[at] {
                OptInstr::Jump { target: t } | OptInstr::Branch { target: t, .. } => *t = target,
                other => return Err(CompileFailure::Internal(format!("fixup on {:?}", other))),
            }
        }
        Ok(())
    }

    // ========== Instructions ==========

    fn instruction(&mut self, index: usize, state: &AbstractState) -> Result<(), CompileFailure> {
        let (offset, instruction) = self.analysis.instructions[index];
        let h = state.stack.len();
        match instruction {
            Instruction::Nop | Instruction::Pop => {}
            Instruction::Dup => {
                if state.stack[h - 1] == AbstractValue::Unknown {
                    self.emit(OptInstr::Move {
                        dst: self.stack(h),
                        src: self.stack(h - 1),
                    });
                }
            }
            Instruction::Swap => {
                let a = self.stack(h - 2);
                let b = self.stack(h - 1);
                let a_real = state.stack[h - 2] == AbstractValue::Unknown;
                let b_real = state.stack[h - 1] == AbstractValue::Unknown;
                if b_real {
                    self.emit(OptInstr::Move { dst: self.scratch, src: b });
                }
                if a_real {
                    self.emit(OptInstr::Move { dst: b, src: a });
                }
                if b_real {
                    self.emit(OptInstr::Move { dst: a, src: self.scratch });
                }
            }
            Instruction::LoadConst(c) => {
                let value = match self.chunk.get_constant(c) {
                    Some(Constant::Number(n)) => ConstValue::Number(*n),
                    Some(Constant::String(s)) => ConstValue::String(s.clone()),
                    None => {
                        return Err(CompileFailure::InvalidBytecode(format!(
                            "constant {} out of range at offset {}",
                            c, offset
                        )))
                    }
                };
                self.emit(OptInstr::LoadConst { dst: self.stack(h), value });
            }
            Instruction::LoadUndefined => self.load_const(h, ConstValue::Undefined),
            Instruction::LoadNull => self.load_const(h, ConstValue::Null),
            Instruction::LoadTrue => self.load_const(h, ConstValue::Boolean(true)),
            Instruction::LoadFalse => self.load_const(h, ConstValue::Boolean(false)),
            Instruction::GetLocal(l) => {
                if state.locals[l as usize] == AbstractValue::Unknown {
                    self.emit(OptInstr::Move {
                        dst: self.stack(h),
                        src: self.local(l),
                    });
                }
            }
            Instruction::SetLocal(l) => {
                if state.stack[h - 1] == AbstractValue::Unknown {
                    self.emit(OptInstr::Move {
                        dst: self.local(l),
                        src: self.stack(h - 1),
                    });
                }
            }
            Instruction::GetGlobal(c) => {
                let name = self.name(c, offset)?;
                self.get_global(index, state, name);
            }
            Instruction::SetGlobal(c) => {
                let name = self.name(c, offset)?;
                let src = self.value_at(state, h - 1)?;
                self.emit(OptInstr::SetGlobal { name, src });
            }
            Instruction::GetNamed { name, site } => {
                let name = self.name(name, offset)?;
                self.get_named(index, state, name, site)?;
            }
            Instruction::SetNamed { name, site } => {
                let name = self.name(name, offset)?;
                self.set_named(index, state, name, site)?;
            }
            Instruction::DefineNamed(name) => {
                let name = self.name(name, offset)?;
                match state.stack[h - 2] {
                    AbstractValue::Alloc(s) => self.store_virtual_field(state, s, &name, h - 1)?,
                    AbstractValue::Unknown => {
                        let value = self.value_at(state, h - 1)?;
                        self.emit(OptInstr::DefineNamed {
                            object: self.stack(h - 2),
                            name,
                            value,
                        });
                    }
                }
            }
            Instruction::LoadElement(site) => self.load_element(index, state, site)?,
            Instruction::StoreElement(site) => self.store_element(index, state, site)?,
            Instruction::CreateObject => {
                if !self.escape.is_virtual(index) {
                    self.emit(OptInstr::CreateObject { dst: self.stack(h) });
                }
            }
            Instruction::NewArray(len) => self.emit(OptInstr::NewArray {
                dst: self.stack(h),
                len: len as usize,
            }),
            Instruction::Add(site) => {
                let plan = speculate(self.request.feedback.slot(site), true, true);
                self.binary(index, state, site, plan, IntOp::Add, FloatOp::Add, GenericBinary::Add)?;
            }
            Instruction::Arith(op, site) => {
                let generic = GenericBinary::Arith(op);
                let float = FloatOp::from_arith(op);
                match op {
                    ArithOp::Sub | ArithOp::Mul => {
                        let int = if op == ArithOp::Sub { IntOp::Sub } else { IntOp::Mul };
                        let plan = speculate(self.request.feedback.slot(site), true, false);
                        self.binary(index, state, site, plan, int, float, generic)?;
                    }
                    ArithOp::Div | ArithOp::Mod => {
                        let plan = speculate(self.request.feedback.slot(site), false, false);
                        self.binary(index, state, site, plan, IntOp::Add, float, generic)?;
                    }
                }
            }
            Instruction::Compare(op, site) => {
                let lhs = self.value_at(state, h - 2)?;
                let rhs = self.value_at(state, h - 1)?;
                let dst = lhs;
                match speculate(self.request.feedback.slot(site), true, false) {
                    Speculation::NoFeedback => self.no_feedback(index, state, site),
                    Speculation::Smi => {
                        let guard = self.guard(index, state, Some(site));
                        self.emit(OptInstr::CheckSmi { reg: lhs, guard });
                        self.emit(OptInstr::CheckSmi { reg: rhs, guard });
                        self.emit(OptInstr::IntCompare { op, dst, lhs, rhs });
                    }
                    Speculation::Number => {
                        let guard = self.guard(index, state, Some(site));
                        self.emit(OptInstr::CheckNumber { reg: lhs, guard });
                        self.emit(OptInstr::CheckNumber { reg: rhs, guard });
                        self.emit(OptInstr::FloatCompare { op, dst, lhs, rhs });
                    }
                    Speculation::String | Speculation::Generic => self.emit(OptInstr::Binary {
                        op: GenericBinary::Compare(op),
                        dst,
                        lhs,
                        rhs,
                    }),
                }
            }
            Instruction::StrictEq | Instruction::StrictNe => {
                let op = if instruction == Instruction::StrictEq {
                    GenericBinary::StrictEq
                } else {
                    GenericBinary::StrictNe
                };
                let lhs = self.value_at(state, h - 2)?;
                let rhs = self.value_at(state, h - 1)?;
                self.emit(OptInstr::Binary { op, dst: lhs, lhs, rhs });
            }
            Instruction::Neg | Instruction::Not => {
                let op = if instruction == Instruction::Neg {
                    GenericUnary::Neg
                } else {
                    GenericUnary::Not
                };
                let src = self.value_at(state, h - 1)?;
                self.emit(OptInstr::Unary { op, dst: src, src });
            }
            Instruction::Jump(target) => {
                self.fixups.push((self.code.len(), target));
                self.emit(OptInstr::Jump { target: 0 });
            }
            Instruction::JumpIfFalse(target) | Instruction::JumpIfTrue(target) => {
                let cond = self.value_at(state, h - 1)?;
                let when = matches!(instruction, Instruction::JumpIfTrue(_));
                self.fixups.push((self.code.len(), target));
                self.emit(OptInstr::Branch { cond, when, target: 0 });
            }
            Instruction::Call { function, argc } => {
                let argc = argc as usize;
                let args = (h - argc..h)
                    .map(|d| self.value_at(state, d))
                    .collect::<Result<Vec<_>, _>>()?;
                self.emit(OptInstr::Call {
                    dst: self.stack(h - argc),
                    function: FunctionId(function as u32),
                    args,
                });
                // the callee may have invalidated this code
                let frame_state = self.frame_state_after(index, 0)?;
                let next = self
                    .analysis
                    .instructions
                    .get(index + 1)
                    .map_or(self.chunk.code.len(), |(o, _)| *o);
                let guard = self.add_guard(frame_state, None, next);
                self.emit(OptInstr::CheckCodeValid { guard });
            }
            Instruction::Return => {
                let src = self.value_at(state, h - 1)?;
                self.emit(OptInstr::Return { src });
            }
            Instruction::ReturnUndefined => self.emit(OptInstr::ReturnUndefined),
            Instruction::Throw => {
                let src = self.value_at(state, h - 1)?;
                self.emit(OptInstr::Throw { src });
            }
            Instruction::Emit => {
                let src = self.value_at(state, h - 1)?;
                self.emit(OptInstr::Emit { src });
            }
            Instruction::Yield => {
                let value = self.value_at(state, h - 1)?;
                // resumption pushes the sent value onto the saved stack
                let frame_state = self.frame_state_after(index, 1)?;
                self.emit(OptInstr::Suspend { value, frame_state });
            }
        }
        Ok(())
    }

    fn load_const(&mut self, h: usize, value: ConstValue) {
        self.emit(OptInstr::LoadConst { dst: self.stack(h), value });
    }

    fn no_feedback(&mut self, index: usize, state: &AbstractState, site: u16) {
        let guard = self.guard(index, state, Some(site));
        self.emit(OptInstr::Deopt {
            guard,
            reason: DeoptReason::InsufficientFeedback,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn binary(
        &mut self,
        index: usize,
        state: &AbstractState,
        site: u16,
        plan: Speculation,
        int: IntOp,
        float: FloatOp,
        generic: GenericBinary,
    ) -> Result<(), CompileFailure> {
        let h = state.stack.len();
        let lhs = self.value_at(state, h - 2)?;
        let rhs = self.value_at(state, h - 1)?;
        let dst = lhs;
        match plan {
            Speculation::NoFeedback => self.no_feedback(index, state, site),
            Speculation::Smi => {
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::CheckSmi { reg: lhs, guard });
                self.emit(OptInstr::CheckSmi { reg: rhs, guard });
                self.emit(OptInstr::IntBinary {
                    op: int,
                    dst,
                    lhs,
                    rhs,
                    guard,
                });
            }
            Speculation::Number => {
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::CheckNumber { reg: lhs, guard });
                self.emit(OptInstr::CheckNumber { reg: rhs, guard });
                self.emit(OptInstr::FloatBinary { op: float, dst, lhs, rhs });
            }
            Speculation::String => {
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::CheckString { reg: lhs, guard });
                self.emit(OptInstr::CheckString { reg: rhs, guard });
                self.emit(OptInstr::StringConcat { dst, lhs, rhs });
            }
            Speculation::Generic => self.emit(OptInstr::Binary {
                op: generic,
                dst,
                lhs,
                rhs,
            }),
        }
        Ok(())
    }

    fn get_global(&mut self, index: usize, state: &AbstractState, name: String) {
        let dst = self.stack(state.stack.len());
        let folded = self
            .request
            .globals
            .get(&name)
            .and_then(|g| g.constant.clone().map(|value| (g.version, value)));
        match folded {
            Some((version, value)) => {
                let guard = self.guard(index, state, None);
                self.global_dependencies.push((name.clone(), version));
                self.emit(OptInstr::LoadGlobalConstant {
                    dst,
                    name,
                    version,
                    value,
                    guard,
                });
            }
            None => self.emit(OptInstr::GetGlobal { dst, name }),
        }
    }

    fn get_named(&mut self, index: usize, state: &AbstractState, name: String, site: u16) -> Result<(), CompileFailure> {
        let h = state.stack.len();
        let object = self.stack(h - 1);
        if let AbstractValue::Alloc(s) = state.stack[h - 1] {
            let defined = state.layouts.get(&s).is_some_and(|names| names.contains(&name));
            if !defined {
                self.load_const(h - 1, ConstValue::Undefined);
            } else if self.escape.field(s, &name) == AbstractValue::Unknown {
                let src = self.field_reg(s, &name)?;
                self.emit(OptInstr::Move { dst: object, src });
            }
            return Ok(());
        }

        let Some(slot) = self.feedback_slot(site) else {
            self.emit(OptInstr::GetNamed { dst: object, object, name });
            return Ok(());
        };
        if slot.cardinality() == Cardinality::Uninitialized {
            self.no_feedback(index, state, site);
        } else if slot.all_kinds(|k| matches!(k, Kind::Object(_))) && slot.handlers().len() == slot.kinds().len() {
            let cases = slot
                .handlers()
                .iter()
                .map(|(shape, handler)| {
                    let access = match handler {
                        PropertyHandler::Field(o) => FieldAccess::Slot(*o),
                        PropertyHandler::Missing => FieldAccess::Missing,
                    };
                    (*shape, access)
                })
                .collect();
            let guard = self.guard(index, state, Some(site));
            self.emit(OptInstr::LoadField {
                dst: object,
                object,
                cases,
                guard,
            });
        } else if name == "length" && slot.all_kinds(|k| *k == Kind::Array) {
            let guard = self.guard(index, state, Some(site));
            self.emit(OptInstr::ArrayLength {
                dst: object,
                array: object,
                guard,
            });
        } else {
            self.emit(OptInstr::GetNamed { dst: object, object, name });
        }
        Ok(())
    }

    fn set_named(&mut self, index: usize, state: &AbstractState, name: String, site: u16) -> Result<(), CompileFailure> {
        let h = state.stack.len();
        if let AbstractValue::Alloc(s) = state.stack[h - 2] {
            return self.store_virtual_field(state, s, &name, h - 1);
        }
        let object = self.stack(h - 2);
        let value = self.value_at(state, h - 1)?;
        let Some(slot) = self.feedback_slot(site) else {
            self.emit(OptInstr::SetNamed { object, name, value });
            return Ok(());
        };
        let fields: Option<Vec<_>> = slot
            .handlers()
            .iter()
            .map(|(shape, handler)| match handler {
                PropertyHandler::Field(o) => Some((*shape, *o)),
                PropertyHandler::Missing => None,
            })
            .collect();
        match fields {
            _ if slot.cardinality() == Cardinality::Uninitialized => self.no_feedback(index, state, site),
            Some(cases)
                if slot.all_kinds(|k| matches!(k, Kind::Object(_))) && cases.len() == slot.kinds().len() =>
            {
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::StoreField {
                    object,
                    value,
                    cases,
                    guard,
                });
            }
            _ => self.emit(OptInstr::SetNamed { object, name, value }),
        }
        Ok(())
    }

    fn store_virtual_field(
        &mut self,
        state: &AbstractState,
        alloc: AllocId,
        name: &str,
        depth: usize,
    ) -> Result<(), CompileFailure> {
        if state.stack[depth] == AbstractValue::Unknown {
            let dst = self.field_reg(alloc, name)?;
            self.emit(OptInstr::Move {
                dst,
                src: self.stack(depth),
            });
        }
        Ok(())
    }

    fn feedback_slot(&self, site: u16) -> Option<&'a FeedbackSlot> {
        let request: &'a CompileRequest = self.request;
        request.feedback.slot(site)
    }

    fn load_element(&mut self, index: usize, state: &AbstractState, site: u16) -> Result<(), CompileFailure> {
        let h = state.stack.len();
        let array = self.value_at(state, h - 2)?;
        let idx = self.value_at(state, h - 1)?;
        match self.feedback_slot(site) {
            Some(slot) if slot.cardinality() == Cardinality::Uninitialized => self.no_feedback(index, state, site),
            Some(slot) if slot.all_kinds(|k| *k == Kind::Array) && !slot.saw_non_smi_index => {
                let hole_mode = if slot.saw_hole_or_oob {
                    HoleMode::Undefined
                } else {
                    HoleMode::Deopt
                };
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::CheckSmi { reg: idx, guard });
                self.emit(OptInstr::LoadElement {
                    dst: array,
                    array,
                    index: idx,
                    hole_mode,
                    guard,
                });
            }
            _ => self.emit(OptInstr::GenericLoadElement {
                dst: array,
                array,
                index: idx,
            }),
        }
        Ok(())
    }

    fn store_element(&mut self, index: usize, state: &AbstractState, site: u16) -> Result<(), CompileFailure> {
        let h = state.stack.len();
        let array = self.value_at(state, h - 3)?;
        let idx = self.value_at(state, h - 2)?;
        let value = self.value_at(state, h - 1)?;
        match self.feedback_slot(site) {
            Some(slot) if slot.cardinality() == Cardinality::Uninitialized => self.no_feedback(index, state, site),
            Some(slot)
                if slot.all_kinds(|k| *k == Kind::Array) && !slot.saw_non_smi_index && !slot.saw_hole_or_oob =>
            {
                let guard = self.guard(index, state, Some(site));
                self.emit(OptInstr::CheckSmi { reg: idx, guard });
                self.emit(OptInstr::StoreElement {
                    array,
                    index: idx,
                    value,
                    guard,
                });
            }
            _ => self.emit(OptInstr::GenericStoreElement {
                array,
                index: idx,
                value,
            }),
        }
        Ok(())
    }
}

/// Builds the object table of one frame state
struct Describer<'b> {
    state: &'b AbstractState,
    escape: &'b EscapeAnalysis,
    field_regs: &'b HashMap<(AllocId, String), Reg>,
    objects: Vec<ObjectDesc>,
    index: HashMap<AllocId, u32>,
}

impl Describer<'_> {
    fn value(&mut self, value: AbstractValue, reg: Reg) -> FrameValue {
        match value {
            AbstractValue::Unknown => FrameValue::Register(reg),
            AbstractValue::Alloc(s) => FrameValue::Object(self.object(s)),
        }
    }

    fn object(&mut self, alloc: AllocId) -> u32 {
        if let Some(i) = self.index.get(&alloc) {
            return *i;
        }
        let i = self.objects.len() as u32;
        self.objects.push(ObjectDesc { fields: Vec::new() });
        self.index.insert(alloc, i);
        let names = self.state.layouts.get(&alloc).cloned().unwrap_or_default();
        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            let value = match self.escape.field(alloc, &name) {
                AbstractValue::Alloc(t) => FrameValue::Object(self.object(t)),
                AbstractValue::Unknown => self
                    .field_regs
                    .get(&(alloc, name.clone()))
                    .map_or(FrameValue::Dead, |r| FrameValue::Register(*r)),
            };
            fields.push((name, value));
        }
        self.objects[i as usize].fields = fields;
        i
    }
}
