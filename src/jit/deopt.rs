//! Deoptimization
//!
//! When a guard fails, optimized execution stops at the protected bytecode
//! and the frame is handed back to the interpreter. The guard's frame state
//! says where every interpreter local and stack slot lives; this module
//! reads those registers ([`on_guard_failure`]), rebuilds elided objects on
//! demand ([`materialize`]) and tracks repeated failures so a function that
//! keeps deoptimizing stops being recompiled for a while ([`DeoptPolicy`]).

use super::ir::{FrameStateId, FrameValue, GuardId, OptimizedUnit, Slot};
use super::scheduler::TierState;
use crate::engine::FunctionId;
use crate::error::{Error, Result};
use crate::runtime::ops;
use crate::runtime::{JsObject, ShapeTable, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{error, trace, warn};

/// Why optimized code gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    NotSmi,
    NotNumber,
    NotString,
    Overflow,
    MinusZero,
    WrongShape,
    NotAnObject,
    NotArray,
    OutOfBounds,
    Hole,
    InsufficientFeedback,
    GlobalCellChanged,
    CodeInvalidated,
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A captured value of the failing frame
#[derive(Debug, Clone)]
pub enum LiveValue {
    Value(Value),
    /// The slot was not live
    Dead,
    /// An elided allocation, built only if the frame is resumed
    Pending(u32),
}

/// Register contents of the failing frame, in interpreter layout
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub bytecode_offset: usize,
    pub locals: Vec<LiveValue>,
    pub stack: Vec<LiveValue>,
    /// Field lists of pending objects, in definition order
    pub objects: Vec<Vec<(String, LiveValue)>>,
}

/// A guard failure, consumed right away by the engine
#[derive(Debug, Clone)]
pub struct DeoptEvent {
    pub function: FunctionId,
    pub reason: DeoptReason,
    pub guard: GuardId,
    pub site: Option<u16>,
    pub frame: CapturedFrame,
}

impl DeoptEvent {
    pub fn bytecode_offset(&self) -> usize {
        self.frame.bytecode_offset
    }
}

/// Convert a register to a tagged value
pub fn slot_value(slot: &Slot) -> Option<Value> {
    match slot {
        Slot::Empty => None,
        Slot::Int(i) => Some(Value::Number(*i as f64)),
        Slot::Float(f) => Some(Value::Number(*f)),
        Slot::Tagged(v) => Some(v.clone()),
    }
}

fn capture_value(unit: &OptimizedUnit, value: FrameValue, registers: &[Slot], offset: usize) -> Result<LiveValue> {
    match value {
        FrameValue::Dead => Ok(LiveValue::Dead),
        FrameValue::Object(index) => Ok(LiveValue::Pending(index)),
        FrameValue::Register(reg) => registers
            .get(reg as usize)
            .and_then(slot_value)
            .map(LiveValue::Value)
            .ok_or_else(|| {
                error!(function = %unit.name, reg, offset, "live value missing from optimized frame");
                Error::invariant(format!(
                    "{}: register r{} holds no value for a live slot at offset {}",
                    unit.name, reg, offset
                ))
            }),
    }
}

/// Read the interpreter frame described by `state` out of `registers`
pub fn capture_frame(unit: &OptimizedUnit, state: FrameStateId, registers: &[Slot]) -> Result<CapturedFrame> {
    let state = unit
        .frame_state(state)
        .ok_or_else(|| Error::invariant(format!("{}: unknown frame state {}", unit.name, state.0)))?;
    let offset = state.bytecode_offset;
    let capture_all = |values: &[FrameValue]| {
        values
            .iter()
            .map(|v| capture_value(unit, *v, registers, offset))
            .collect::<Result<Vec<_>>>()
    };
    let locals = capture_all(&state.locals)?;
    let stack = capture_all(&state.stack)?;
    let objects = state
        .objects
        .iter()
        .map(|desc| {
            desc.fields
                .iter()
                .map(|(name, v)| Ok((name.clone(), capture_value(unit, *v, registers, offset)?)))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CapturedFrame {
        bytecode_offset: offset,
        locals,
        stack,
        objects,
    })
}

/// Build the deopt event for a failed guard
pub fn on_guard_failure(
    unit: &OptimizedUnit,
    guard: GuardId,
    reason: DeoptReason,
    registers: &[Slot],
) -> Result<DeoptEvent> {
    let info = unit
        .guard(guard)
        .ok_or_else(|| Error::invariant(format!("{}: unknown guard {}", unit.name, guard)))?;
    trace!(function = %unit.name, guard, %reason, offset = info.bytecode_offset, "guard failed");
    Ok(DeoptEvent {
        function: unit.function,
        reason,
        guard,
        site: info.site,
        frame: capture_frame(unit, info.frame_state, registers)?,
    })
}

/// Lazily builds pending objects; each is created once, so aliasing and
/// cycles come out as in the original graph
struct Materializer<'a> {
    shapes: &'a ShapeTable,
    objects: &'a [Vec<(String, LiveValue)>],
    arena: Vec<Option<Value>>,
}

impl Materializer<'_> {
    fn resolve(&mut self, value: &LiveValue) -> Result<Value> {
        match value {
            LiveValue::Value(v) => Ok(v.clone()),
            LiveValue::Dead => Ok(Value::Undefined),
            LiveValue::Pending(index) => self.object(*index as usize),
        }
    }

    fn object(&mut self, index: usize) -> Result<Value> {
        let slot = self
            .arena
            .get(index)
            .ok_or_else(|| Error::invariant(format!("pending object {} out of range", index)))?;
        if let Some(existing) = slot {
            return Ok(existing.clone());
        }
        let object = Rc::new(RefCell::new(JsObject::new(self.shapes.root())));
        self.arena[index] = Some(Value::Object(Rc::clone(&object)));
        let objects = self.objects;
        for (name, field) in &objects[index] {
            let value = self.resolve(field)?;
            ops::define_property(self.shapes, &mut object.borrow_mut(), name, value);
        }
        Ok(Value::Object(object))
    }
}

/// Turn a captured frame into interpreter locals and stack
pub fn materialize(shapes: &ShapeTable, frame: &CapturedFrame) -> Result<(Vec<Value>, Vec<Value>)> {
    let mut materializer = Materializer {
        shapes,
        objects: &frame.objects,
        arena: vec![None; frame.objects.len()],
    };
    let locals = frame
        .locals
        .iter()
        .map(|v| materializer.resolve(v))
        .collect::<Result<Vec<_>>>()?;
    let stack = frame
        .stack
        .iter()
        .map(|v| materializer.resolve(v))
        .collect::<Result<Vec<_>>>()?;
    Ok((locals, stack))
}

/// Repeated-deopt bookkeeping
#[derive(Debug, Clone)]
pub struct DeoptPolicy {
    retry_budget: u32,
    cooldown_invocations: u32,
}

impl DeoptPolicy {
    pub fn new(retry_budget: u32, cooldown_invocations: u32) -> Self {
        Self {
            retry_budget,
            cooldown_invocations,
        }
    }

    /// Count a deopt at `offset`; returns true when the function enters cooldown
    pub fn record(&self, function: &str, state: &mut TierState, offset: usize) -> bool {
        state.deopt_count += 1;
        state.invocation_count = 0;
        let count = state.site_deopts.entry(offset).or_insert(0);
        *count += 1;
        if *count > self.retry_budget {
            warn!(
                function,
                offset,
                deopts = *count,
                cooldown = self.cooldown_invocations,
                "repeated deopts, entering cooldown"
            );
            state.site_deopts.clear();
            state.cooldown_remaining = self.cooldown_invocations;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{FrameState, GuardInfo, ObjectDesc};

    fn unit_with_state(state: FrameState) -> OptimizedUnit {
        OptimizedUnit {
            function: FunctionId(0),
            name: "f".into(),
            bytecode_version: 0,
            code: Vec::new(),
            guards: vec![GuardInfo {
                frame_state: FrameStateId(0),
                site: Some(0),
                bytecode_offset: state.bytecode_offset,
            }],
            frame_states: vec![state],
            register_count: 4,
            param_count: 1,
            local_count: 2,
            global_dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_capture_converts_unboxed_registers() {
        let unit = unit_with_state(FrameState {
            bytecode_offset: 7,
            locals: vec![FrameValue::Register(0), FrameValue::Dead],
            stack: vec![FrameValue::Register(2), FrameValue::Register(3)],
            objects: Vec::new(),
        });
        let registers = vec![
            Slot::Tagged(Value::string("s")),
            Slot::Empty,
            Slot::Int(1 << 30),
            Slot::Float(0.5),
        ];
        let event = on_guard_failure(&unit, 0, DeoptReason::Overflow, &registers).unwrap();
        assert_eq!(event.bytecode_offset(), 7);
        assert_eq!(event.site, Some(0));

        let shapes = ShapeTable::new();
        let (locals, stack) = materialize(&shapes, &event.frame).unwrap();
        assert_eq!(locals, vec![Value::string("s"), Value::Undefined]);
        assert_eq!(stack, vec![Value::Number(1073741824.0), Value::Number(0.5)]);
    }

    #[test]
    fn test_missing_register_is_fatal() {
        let unit = unit_with_state(FrameState {
            bytecode_offset: 0,
            locals: vec![FrameValue::Register(1)],
            stack: Vec::new(),
            objects: Vec::new(),
        });
        let registers = vec![Slot::Empty; 4];
        let err = on_guard_failure(&unit, 0, DeoptReason::NotSmi, &registers).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_materialize_cycle_and_alias() {
        // a = { n: 1, peer: b }, b = { back: a }; both locals point at a
        let unit = unit_with_state(FrameState {
            bytecode_offset: 0,
            locals: vec![FrameValue::Object(0), FrameValue::Object(0)],
            stack: vec![FrameValue::Object(1)],
            objects: vec![
                ObjectDesc {
                    fields: vec![
                        ("n".into(), FrameValue::Register(2)),
                        ("peer".into(), FrameValue::Object(1)),
                    ],
                },
                ObjectDesc {
                    fields: vec![("back".into(), FrameValue::Object(0))],
                },
            ],
        });
        let registers = vec![Slot::Empty, Slot::Empty, Slot::Int(1), Slot::Empty];
        let event = on_guard_failure(&unit, 0, DeoptReason::WrongShape, &registers).unwrap();
        assert!(matches!(event.frame.locals[0], LiveValue::Pending(0)));

        let shapes = ShapeTable::new();
        let (locals, stack) = materialize(&shapes, &event.frame).unwrap();
        assert_eq!(locals[0], locals[1]);
        let b = ops::get_named(&locals[0], "peer").unwrap();
        assert_eq!(b, stack[0]);
        assert_eq!(ops::get_named(&b, "back").unwrap(), locals[0]);
        assert_eq!(ops::get_named(&locals[0], "n").unwrap(), Value::Number(1.0));

        // same layout as building { n, peer } by hand
        let by_hand = shapes.transition(&shapes.transition(&shapes.root(), "n"), "peer");
        let Value::Object(a) = &locals[0] else { panic!("expected object") };
        assert_eq!(a.borrow().shape.id(), by_hand.id());
    }

    #[test]
    fn test_policy_enters_cooldown_after_budget() {
        let policy = DeoptPolicy::new(2, 10);
        let mut state = TierState::default();
        state.invocation_count = 50;
        assert!(!policy.record("f", &mut state, 4));
        assert_eq!(state.invocation_count, 0);
        assert!(!policy.record("f", &mut state, 4));
        assert!(!policy.record("f", &mut state, 9));
        assert!(policy.record("f", &mut state, 4));
        assert_eq!(state.cooldown_remaining, 10);
        assert!(state.site_deopts.is_empty());
        assert_eq!(state.deopt_count, 4);
    }
}
