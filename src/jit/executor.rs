//! Optimized-tier executor
//!
//! Runs an [`OptimizedUnit`] over a register file. Guards compare the
//! speculation against the actual register contents; on a mismatch the frame
//! is captured through the guard's frame state and handed back to the engine
//! as a [`DeoptEvent`]. The executor never records feedback.

use super::deopt::{self, CapturedFrame, DeoptEvent, DeoptReason};
use super::feedback::is_smi;
use super::ir::{
    ConstValue, FieldAccess, GenericBinary, GenericUnary, GuardId, HoleMode, IntOp, OptInstr, Reg, Slot,
};
use super::OptimizedCode;
use crate::error::{Error, Result};
use crate::interpreter::Host;
use crate::runtime::ops;
use crate::runtime::{JsArray, JsObject, Value};
use std::rc::Rc;

/// How an optimized activation ended
#[derive(Debug)]
pub enum ExecOutcome {
    Return(Value),
    /// A guard failed; the interpreter continues from the captured frame
    Deopt(DeoptEvent),
    /// A generator yielded; the frame resumes in the baseline tier
    Suspend { value: Value, frame: CapturedFrame },
}

/// Guard outcome inside the dispatch loop
enum Step {
    Next,
    Fail(GuardId, DeoptReason),
}

struct Frame<'c> {
    code: &'c OptimizedCode,
    registers: Vec<Slot>,
}

impl Frame<'_> {
    fn slot(&self, reg: Reg) -> &Slot {
        self.registers.get(reg as usize).unwrap_or(&Slot::Empty)
    }

    fn set(&mut self, reg: Reg, slot: Slot) {
        if let Some(r) = self.registers.get_mut(reg as usize) {
            *r = slot;
        }
    }

    fn value(&self, reg: Reg) -> Result<Value> {
        deopt::slot_value(self.slot(reg))
            .ok_or_else(|| Error::invariant(format!("{}: read of empty register r{}", self.code.unit.name, reg)))
    }

    fn int(&self, reg: Reg) -> Result<i32> {
        match self.slot(reg) {
            Slot::Int(i) => Ok(*i),
            other => Err(Error::invariant(format!("r{} is not an unboxed integer: {:?}", reg, other))),
        }
    }

    fn float(&self, reg: Reg) -> Result<f64> {
        match self.slot(reg) {
            Slot::Int(i) => Ok(*i as f64),
            Slot::Float(f) => Ok(*f),
            other => Err(Error::invariant(format!("r{} is not an unboxed number: {:?}", reg, other))),
        }
    }
}

fn number_slot(n: f64) -> Slot {
    if is_smi(n) {
        Slot::Int(n as i32)
    } else {
        Slot::Float(n)
    }
}

fn const_slot(value: &ConstValue) -> Slot {
    match value {
        ConstValue::Number(n) => number_slot(*n),
        other => Slot::Tagged(other.to_value()),
    }
}

/// Execute optimized code for one activation
pub fn run<H: Host + ?Sized>(host: &mut H, code: &OptimizedCode, args: &[Value]) -> Result<ExecOutcome> {
    let unit = &code.unit;
    let mut frame = Frame {
        code,
        registers: vec![Slot::Empty; unit.register_count],
    };
    for local in 0..unit.local_count {
        let value = if local < unit.param_count {
            args.get(local).cloned().unwrap_or(Value::Undefined)
        } else {
            Value::Undefined
        };
        frame.registers[local] = Slot::Tagged(value);
    }

    let mut pc = 0;
    loop {
        let instr = unit
            .code
            .get(pc)
            .ok_or_else(|| Error::invariant(format!("{}: optimized pc {} out of range", unit.name, pc)))?;
        pc += 1;

        let step = match instr {
            OptInstr::Move { dst, src } => {
                let slot = frame.slot(*src).clone();
                frame.set(*dst, slot);
                Step::Next
            }
            OptInstr::LoadConst { dst, value } => {
                frame.set(*dst, const_slot(value));
                Step::Next
            }

            // ========== Guards ==========
            OptInstr::CheckSmi { reg, guard } => {
                let converted = match frame.slot(*reg) {
                    Slot::Int(i) => Some(*i),
                    Slot::Float(f) if is_smi(*f) => Some(*f as i32),
                    Slot::Tagged(Value::Number(n)) if is_smi(*n) => Some(*n as i32),
                    _ => None,
                };
                match converted {
                    Some(i) => {
                        frame.set(*reg, Slot::Int(i));
                        Step::Next
                    }
                    None => Step::Fail(*guard, DeoptReason::NotSmi),
                }
            }
            OptInstr::CheckNumber { reg, guard } => match frame.slot(*reg) {
                Slot::Int(_) | Slot::Float(_) => Step::Next,
                Slot::Tagged(Value::Number(n)) => {
                    let slot = number_slot(*n);
                    frame.set(*reg, slot);
                    Step::Next
                }
                _ => Step::Fail(*guard, DeoptReason::NotNumber),
            },
            OptInstr::CheckString { reg, guard } => match frame.slot(*reg) {
                Slot::Tagged(Value::String(_)) => Step::Next,
                _ => Step::Fail(*guard, DeoptReason::NotString),
            },
            OptInstr::CheckCodeValid { guard } => {
                if code.is_valid() {
                    Step::Next
                } else {
                    Step::Fail(*guard, DeoptReason::CodeInvalidated)
                }
            }
            OptInstr::Deopt { guard, reason } => Step::Fail(*guard, *reason),

            // ========== Specialized arithmetic ==========
            OptInstr::IntBinary {
                op,
                dst,
                lhs,
                rhs,
                guard,
            } => {
                let (a, b) = (frame.int(*lhs)?, frame.int(*rhs)?);
                let result = match op {
                    IntOp::Add => a.checked_add(b).ok_or(DeoptReason::Overflow),
                    IntOp::Sub => a.checked_sub(b).ok_or(DeoptReason::Overflow),
                    IntOp::Mul => match a.checked_mul(b) {
                        None => Err(DeoptReason::Overflow),
                        Some(0) if a < 0 || b < 0 => Err(DeoptReason::MinusZero),
                        Some(r) => Ok(r),
                    },
                };
                match result {
                    Ok(r) => {
                        frame.set(*dst, Slot::Int(r));
                        Step::Next
                    }
                    Err(reason) => Step::Fail(*guard, reason),
                }
            }
            OptInstr::FloatBinary { op, dst, lhs, rhs } => {
                let r = op.apply(frame.float(*lhs)?, frame.float(*rhs)?);
                frame.set(*dst, Slot::Float(r));
                Step::Next
            }
            OptInstr::IntCompare { op, dst, lhs, rhs } => {
                let r = op.apply_i32(frame.int(*lhs)?, frame.int(*rhs)?);
                frame.set(*dst, Slot::Tagged(Value::Boolean(r)));
                Step::Next
            }
            OptInstr::FloatCompare { op, dst, lhs, rhs } => {
                let r = op.apply_f64(frame.float(*lhs)?, frame.float(*rhs)?);
                frame.set(*dst, Slot::Tagged(Value::Boolean(r)));
                Step::Next
            }
            OptInstr::StringConcat { dst, lhs, rhs } => {
                let joined = match (frame.value(*lhs)?, frame.value(*rhs)?) {
                    (Value::String(a), Value::String(b)) => format!("{}{}", a, b),
                    (a, b) => return Err(Error::invariant(format!("string concat of {:?} and {:?}", a, b))),
                };
                frame.set(*dst, Slot::Tagged(Value::String(Rc::from(joined))));
                Step::Next
            }

            // ========== Generic operations ==========
            OptInstr::Binary { op, dst, lhs, rhs } => {
                let (a, b) = (frame.value(*lhs)?, frame.value(*rhs)?);
                let result = match op {
                    GenericBinary::Add => ops::add(&a, &b),
                    GenericBinary::Arith(op) => ops::arith(*op, &a, &b),
                    GenericBinary::Compare(op) => Value::Boolean(ops::compare(*op, &a, &b)),
                    GenericBinary::StrictEq => Value::Boolean(a.strict_equals(&b)),
                    GenericBinary::StrictNe => Value::Boolean(!a.strict_equals(&b)),
                };
                frame.set(*dst, Slot::Tagged(result));
                Step::Next
            }
            OptInstr::Unary { op, dst, src } => {
                let a = frame.value(*src)?;
                let result = match op {
                    GenericUnary::Neg => ops::neg(&a),
                    GenericUnary::Not => ops::not(&a),
                };
                frame.set(*dst, Slot::Tagged(result));
                Step::Next
            }

            // ========== Properties ==========
            OptInstr::LoadField {
                dst,
                object,
                cases,
                guard,
            } => match frame.value(*object)? {
                Value::Object(obj) => {
                    let obj = obj.borrow();
                    let shape = obj.shape.id();
                    match cases.iter().find(|(s, _)| *s == shape) {
                        Some((_, FieldAccess::Slot(i))) => {
                            let value = obj.slots.get(*i).cloned().unwrap_or(Value::Undefined);
                            drop(obj);
                            frame.set(*dst, Slot::Tagged(value));
                            Step::Next
                        }
                        Some((_, FieldAccess::Missing)) => {
                            drop(obj);
                            frame.set(*dst, Slot::Tagged(Value::Undefined));
                            Step::Next
                        }
                        None => Step::Fail(*guard, DeoptReason::WrongShape),
                    }
                }
                _ => Step::Fail(*guard, DeoptReason::NotAnObject),
            },
            OptInstr::StoreField {
                object,
                value,
                cases,
                guard,
            } => match frame.value(*object)? {
                Value::Object(obj) => {
                    let shape = obj.borrow().shape.id();
                    match cases.iter().find(|(s, _)| *s == shape) {
                        Some((_, i)) => {
                            let value = frame.value(*value)?;
                            if let Some(slot) = obj.borrow_mut().slots.get_mut(*i) {
                                *slot = value;
                            }
                            Step::Next
                        }
                        None => Step::Fail(*guard, DeoptReason::WrongShape),
                    }
                }
                _ => Step::Fail(*guard, DeoptReason::NotAnObject),
            },
            OptInstr::ArrayLength { dst, array, guard } => match frame.value(*array)? {
                Value::Array(arr) => {
                    let len = arr.borrow().len() as f64;
                    frame.set(*dst, number_slot(len));
                    Step::Next
                }
                _ => Step::Fail(*guard, DeoptReason::NotArray),
            },
            OptInstr::GetNamed { dst, object, name } => {
                let value = ops::get_named(&frame.value(*object)?, name)?;
                frame.set(*dst, Slot::Tagged(value));
                Step::Next
            }
            OptInstr::SetNamed { object, name, value } => {
                ops::set_named(host.shapes(), &frame.value(*object)?, name, frame.value(*value)?)?;
                Step::Next
            }
            OptInstr::DefineNamed { object, name, value } => {
                ops::set_named(host.shapes(), &frame.value(*object)?, name, frame.value(*value)?)?;
                Step::Next
            }
            OptInstr::LoadElement {
                dst,
                array,
                index,
                hole_mode,
                guard,
            } => match frame.value(*array)? {
                Value::Array(arr) => {
                    let i = frame.int(*index)?;
                    let element = usize::try_from(i).ok().map(|i| arr.borrow().elements.get(i).cloned());
                    let loaded = match (element, hole_mode) {
                        (Some(Some(Some(v))), _) => Ok(v),
                        (_, HoleMode::Undefined) => Ok(Value::Undefined),
                        (Some(Some(None)), HoleMode::Deopt) => Err(DeoptReason::Hole),
                        (_, HoleMode::Deopt) => Err(DeoptReason::OutOfBounds),
                    };
                    match loaded {
                        Ok(v) => {
                            frame.set(*dst, Slot::Tagged(v));
                            Step::Next
                        }
                        Err(reason) => Step::Fail(*guard, reason),
                    }
                }
                _ => Step::Fail(*guard, DeoptReason::NotArray),
            },
            OptInstr::StoreElement {
                array,
                index,
                value,
                guard,
            } => match frame.value(*array)? {
                Value::Array(arr) => {
                    let i = frame.int(*index)?;
                    let len = arr.borrow().len();
                    match usize::try_from(i) {
                        Ok(i) if i < len => {
                            arr.borrow_mut().elements[i] = Some(frame.value(*value)?);
                            Step::Next
                        }
                        _ => Step::Fail(*guard, DeoptReason::OutOfBounds),
                    }
                }
                _ => Step::Fail(*guard, DeoptReason::NotArray),
            },
            OptInstr::GenericLoadElement { dst, array, index } => {
                let load = ops::load_element(&frame.value(*array)?, &frame.value(*index)?)?;
                frame.set(*dst, Slot::Tagged(load.value));
                Step::Next
            }
            OptInstr::GenericStoreElement { array, index, value } => {
                ops::store_element(
                    host.shapes(),
                    &frame.value(*array)?,
                    &frame.value(*index)?,
                    frame.value(*value)?,
                )?;
                Step::Next
            }
            OptInstr::CreateObject { dst } => {
                let object = JsObject::new(host.shapes().root());
                frame.set(*dst, Slot::Tagged(Value::new_object(object)));
                Step::Next
            }
            OptInstr::NewArray { dst, len } => {
                frame.set(*dst, Slot::Tagged(Value::new_array(JsArray::with_holes(*len))));
                Step::Next
            }

            // ========== Globals ==========
            OptInstr::GetGlobal { dst, name } => {
                let value = host.get_global(name)?;
                frame.set(*dst, Slot::Tagged(value));
                Step::Next
            }
            OptInstr::LoadGlobalConstant {
                dst,
                name,
                version,
                value,
                guard,
            } => {
                if host.global_version(name) == Some(*version) {
                    frame.set(*dst, const_slot(value));
                    Step::Next
                } else {
                    Step::Fail(*guard, DeoptReason::GlobalCellChanged)
                }
            }
            OptInstr::SetGlobal { name, src } => {
                host.set_global(name, frame.value(*src)?);
                Step::Next
            }

            // ========== Control ==========
            OptInstr::Call { dst, function, args } => {
                let args = args.iter().map(|r| frame.value(*r)).collect::<Result<Vec<_>>>()?;
                let result = host.call(*function, args)?;
                frame.set(*dst, Slot::Tagged(result));
                Step::Next
            }
            OptInstr::Emit { src } => {
                host.emit(frame.value(*src)?);
                Step::Next
            }
            OptInstr::Throw { src } => return Err(Error::Exception(frame.value(*src)?)),
            OptInstr::Return { src } => return Ok(ExecOutcome::Return(frame.value(*src)?)),
            OptInstr::ReturnUndefined => return Ok(ExecOutcome::Return(Value::Undefined)),
            OptInstr::Jump { target } => {
                pc = *target;
                Step::Next
            }
            OptInstr::Branch { cond, when, target } => {
                if frame.value(*cond)?.to_boolean() == *when {
                    pc = *target;
                }
                Step::Next
            }
            OptInstr::Suspend { value, frame_state } => {
                let value = frame.value(*value)?;
                let captured = deopt::capture_frame(unit, *frame_state, &frame.registers)?;
                return Ok(ExecOutcome::Suspend { value, frame: captured });
            }
        };

        if let Step::Fail(guard, reason) = step {
            let event = deopt::on_guard_failure(unit, guard, reason, &frame.registers)?;
            return Ok(ExecOutcome::Deopt(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, ChunkBuilder};
    use crate::engine::{Engine, FunctionId};
    use crate::jit::compiler::{compile, CompileRequest, CompilerOptions};
    use crate::jit::feedback::FeedbackVector;
    use std::sync::Arc;

    /// Compiles `chunk` with every site having seen `sample` on both sides
    fn optimized(chunk: Chunk, sample: Value) -> OptimizedCode {
        let mut feedback = FeedbackVector::new(&chunk.call_sites, 4);
        for site in 0..chunk.call_sites.len() as u16 {
            feedback.record_binary(site, &sample, &sample, Some(&sample));
        }
        let chunk = Arc::new(chunk);
        let request = CompileRequest {
            function: FunctionId(0),
            bytecode_version: 0,
            chunk: chunk.clone(),
            feedback,
            globals: Default::default(),
            options: CompilerOptions::default(),
        };
        OptimizedCode::new(compile(&request).unwrap(), chunk)
    }

    fn add_code() -> OptimizedCode {
        let mut b = ChunkBuilder::new("add", 2);
        b.get_local(0).get_local(1).add().ret();
        optimized(b.finish().unwrap(), Value::Number(1.0))
    }

    fn deopt_reason(outcome: ExecOutcome) -> DeoptReason {
        match outcome {
            ExecOutcome::Deopt(event) => event.reason,
            other => panic!("expected a deopt, got {:?}", other),
        }
    }

    #[test]
    fn test_int_add_returns_boxed_number() {
        let mut host = Engine::default();
        let code = add_code();
        match run(&mut host, &code, &[Value::Number(1.0), Value::Number(2.0)]).unwrap() {
            ExecOutcome::Return(v) => assert_eq!(v, Value::Number(3.0)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_overflow_fails_guard() {
        let mut host = Engine::default();
        let code = add_code();
        let outcome = run(&mut host, &code, &[Value::Number(i32::MAX as f64), Value::Number(1.0)]).unwrap();
        assert_eq!(deopt_reason(outcome), DeoptReason::Overflow);
    }

    #[test]
    fn test_double_argument_fails_smi_check() {
        let mut host = Engine::default();
        let code = add_code();
        let outcome = run(&mut host, &code, &[Value::Number(0.5), Value::Number(1.0)]).unwrap();
        match outcome {
            ExecOutcome::Deopt(event) => {
                assert_eq!(event.reason, DeoptReason::NotSmi);
                assert_eq!(event.function, FunctionId(0));
                assert_eq!(event.frame.locals.len(), 2);
            }
            other => panic!("expected a deopt, got {:?}", other),
        }
    }

    #[test]
    fn test_yield_suspends_with_frame() {
        let mut b = ChunkBuilder::new("pair", 1);
        b.generator();
        b.get_local(0).number(2.0).mul().yield_value();
        b.get_local(0).add().ret();
        let code = optimized(b.finish().unwrap(), Value::Number(3.0));

        let mut host = Engine::default();
        match run(&mut host, &code, &[Value::Number(4.0)]).unwrap() {
            ExecOutcome::Suspend { value, frame } => {
                assert_eq!(value, Value::Number(8.0));
                assert!(frame.bytecode_offset > 0);
            }
            other => panic!("expected a suspension, got {:?}", other),
        }
    }

    #[test]
    fn test_invalidated_code_still_runs_to_completion() {
        // validity is checked only at CheckCodeValid points, which a leaf has none of
        let mut host = Engine::default();
        let code = add_code();
        code.invalidate();
        assert!(matches!(
            run(&mut host, &code, &[Value::Number(2.0), Value::Number(2.0)]).unwrap(),
            ExecOutcome::Return(_)
        ));
    }
}
