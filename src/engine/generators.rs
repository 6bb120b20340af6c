//! Generator resumption
//!
//! Calling a generator function only creates the object. The body starts on
//! the first `next`, in whichever tier the function routes to at that moment.
//! A suspended frame is always an interpreter frame: optimized code that
//! yields is materialized on the spot, so resumption happens in baseline.

use super::{CodeTier, Engine, FunctionId};
use crate::error::{Error, Result};
use crate::interpreter::{self, Completion, ExecutionContext};
use crate::jit::deopt;
use crate::jit::executor::{self, ExecOutcome};
use crate::runtime::{GeneratorObject, GeneratorState, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

/// Result of one `next` step
#[derive(Debug, Clone, PartialEq)]
pub struct IterResult {
    pub value: Value,
    pub done: bool,
}

impl IterResult {
    fn done(value: Value) -> Self {
        Self { value, done: true }
    }
}

pub(super) fn create(function: FunctionId, args: Vec<Value>) -> Value {
    Value::Generator(Rc::new(RefCell::new(GeneratorObject {
        function,
        state: GeneratorState::NotStarted(args),
    })))
}

impl Engine {
    /// Resume `generator`, passing `sent` as the value of the pending `Yield`.
    /// The first step ignores `sent`.
    pub fn generator_next(&mut self, generator: &Value, sent: Value) -> Result<IterResult> {
        let Value::Generator(object) = generator else {
            return Err(Error::NotAGenerator);
        };
        let (function, state) = {
            let mut object = object.borrow_mut();
            if matches!(object.state, GeneratorState::Running) {
                return Err(Error::GeneratorRunning);
            }
            let state = std::mem::replace(&mut object.state, GeneratorState::Running);
            (object.function, state)
        };

        let step = match state {
            GeneratorState::Completed => {
                object.borrow_mut().state = GeneratorState::Completed;
                return Ok(IterResult::done(Value::Undefined));
            }
            GeneratorState::NotStarted(args) => self.start_generator(function, args),
            GeneratorState::Suspended(mut ctx) => {
                ctx.stack.push(sent);
                interpreter::resume_from_deopt(self, ctx)
            }
            GeneratorState::Running => return Err(Error::GeneratorRunning),
        };

        let mut object = object.borrow_mut();
        match step {
            Ok(Completion::Yield(value, ctx)) => {
                trace!(%function, pc = ctx.pc, "generator suspended");
                object.state = GeneratorState::Suspended(ctx);
                Ok(IterResult { value, done: false })
            }
            Ok(Completion::Return(value)) => {
                object.state = GeneratorState::Completed;
                Ok(IterResult::done(value))
            }
            Err(e) => {
                object.state = GeneratorState::Completed;
                Err(e)
            }
        }
    }

    fn start_generator(&mut self, function: FunctionId, args: Vec<Value>) -> Result<Completion> {
        self.depth += 1;
        let result = self.run_generator_body(function, args);
        self.depth -= 1;
        result
    }

    fn run_generator_body(&mut self, function: FunctionId, args: Vec<Value>) -> Result<Completion> {
        let unit = self.unit_mut(function)?;
        let code = match unit.code.clone() {
            CodeTier::Optimized(code) => code,
            CodeTier::Baseline => {
                unit.stats.baseline_calls += 1;
                let ctx = ExecutionContext::new(function, Arc::clone(&unit.chunk), unit.bytecode_version, args);
                self.stats.baseline_calls += 1;
                return interpreter::execute(self, ctx);
            }
        };
        unit.stats.optimized_calls += 1;
        self.stats.optimized_calls += 1;

        match executor::run(self, &code, &args)? {
            ExecOutcome::Return(value) => Ok(Completion::Return(value)),
            ExecOutcome::Deopt(event) => self.apply_deopt(event, &code),
            ExecOutcome::Suspend { value, frame } => {
                let (locals, stack) = deopt::materialize(&self.shapes, &frame)?;
                let ctx = ExecutionContext {
                    function,
                    chunk: Arc::clone(&code.chunk),
                    bytecode_version: code.unit.bytecode_version,
                    pc: frame.bytecode_offset,
                    locals,
                    stack,
                };
                Ok(Completion::Yield(value, ctx))
            }
        }
    }
}
