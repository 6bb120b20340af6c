//! Baseline interpreter
//!
//! The ground-truth tier. It decodes bytecode directly, makes no assumptions
//! about the values it sees, and records type feedback at every call site.
//! Deoptimized code and suspended generators always resume here.
//!
//! The interpreter does not own functions, globals or feedback; it reaches
//! them through [`Host`], which the engine implements. Calls go back through
//! the host so that callees are routed to whichever tier is current.

use crate::bytecode::{Chunk, Instruction};
use crate::engine::FunctionId;
use crate::error::{Error, Result};
use crate::jit::feedback::FeedbackVector;
use crate::runtime::ops;
use crate::runtime::{JsArray, JsObject, ShapeTable, Value};
use std::sync::Arc;
use tracing::trace;

/// Services the execution tiers need from the engine
pub trait Host {
    /// The shape transition tree
    fn shapes(&self) -> &ShapeTable;

    /// Feedback vector of `function`, if `version` is still its current bytecode
    fn feedback_mut(&mut self, function: FunctionId, version: u32) -> Option<&mut FeedbackVector>;

    /// Read a global; missing globals raise a ReferenceError
    fn get_global(&self, name: &str) -> Result<Value>;

    /// Write a global
    fn set_global(&mut self, name: &str, value: Value);

    /// Write version of a global cell, `None` if it does not exist
    fn global_version(&self, name: &str) -> Option<u32>;

    /// Call a function through the dispatcher
    fn call(&mut self, function: FunctionId, args: Vec<Value>) -> Result<Value>;

    /// Append to the external effect log
    fn emit(&mut self, value: Value);
}

/// An interpreter frame.
///
/// Both tiers agree on this layout: locals (parameters first) plus the
/// operand stack at a bytecode offset. The deoptimizer rebuilds one of
/// these from optimized registers; a suspended generator stores one.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub function: FunctionId,
    pub chunk: Arc<Chunk>,
    /// Bytecode version `chunk` belongs to
    pub bytecode_version: u32,
    /// Offset of the next instruction to execute
    pub pc: usize,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

impl ExecutionContext {
    /// A fresh frame at offset 0; missing arguments are `undefined`, extra ones are dropped
    pub fn new(function: FunctionId, chunk: Arc<Chunk>, bytecode_version: u32, args: Vec<Value>) -> Self {
        let mut locals = args;
        locals.truncate(chunk.param_count as usize);
        locals.resize(chunk.local_count.max(chunk.param_count) as usize, Value::Undefined);
        Self {
            function,
            chunk,
            bytecode_version,
            pc: 0,
            locals,
            stack: Vec::new(),
        }
    }

    fn pop(&mut self, offset: usize) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::malformed(offset, "operand stack underflow"))
    }

    fn peek(&self, offset: usize) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::malformed(offset, "operand stack underflow"))
    }

    fn local(&self, index: u8, offset: usize) -> Result<&Value> {
        self.locals
            .get(index as usize)
            .ok_or_else(|| Error::malformed(offset, format!("local {} out of range", index)))
    }
}

/// How an activation ended
#[derive(Debug)]
pub enum Completion {
    Return(Value),
    /// Suspended at a `Yield`; the context resumes after it
    Yield(Value, ExecutionContext),
}

/// Run a function from its first instruction
pub fn execute<H: Host + ?Sized>(host: &mut H, ctx: ExecutionContext) -> Result<Completion> {
    run(host, ctx)
}

/// Continue a frame from `ctx.pc`.
///
/// Used after deoptimization and to resume suspended generators; the result
/// is indistinguishable from having interpreted the function from the start.
pub fn resume_from_deopt<H: Host + ?Sized>(host: &mut H, ctx: ExecutionContext) -> Result<Completion> {
    trace!(function = %ctx.function, pc = ctx.pc, "resuming in baseline");
    run(host, ctx)
}

fn run<H: Host + ?Sized>(host: &mut H, mut ctx: ExecutionContext) -> Result<Completion> {
    let chunk = Arc::clone(&ctx.chunk);
    let function = ctx.function;
    let version = ctx.bytecode_version;

    loop {
        let offset = ctx.pc;
        if offset >= chunk.code.len() {
            return Ok(Completion::Return(Value::Undefined));
        }
        let (instruction, next) = chunk.decode(offset)?;
        ctx.pc = next;

        match instruction {
            Instruction::Nop => {}
            Instruction::Pop => {
                ctx.pop(offset)?;
            }
            Instruction::Dup => {
                let top = ctx.peek(offset)?.clone();
                ctx.stack.push(top);
            }
            Instruction::Swap => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                ctx.stack.push(b);
                ctx.stack.push(a);
            }

            // ========== Constants ==========
            Instruction::LoadConst(index) => {
                let constant = chunk
                    .get_constant(index)
                    .ok_or_else(|| Error::malformed(offset, format!("constant {} out of range", index)))?;
                ctx.stack.push(constant.to_value());
            }
            Instruction::LoadUndefined => ctx.stack.push(Value::Undefined),
            Instruction::LoadNull => ctx.stack.push(Value::Null),
            Instruction::LoadTrue => ctx.stack.push(Value::Boolean(true)),
            Instruction::LoadFalse => ctx.stack.push(Value::Boolean(false)),

            // ========== Variables ==========
            Instruction::GetLocal(index) => {
                let value = ctx.local(index, offset)?.clone();
                ctx.stack.push(value);
            }
            Instruction::SetLocal(index) => {
                let value = ctx.pop(offset)?;
                let slot = ctx
                    .locals
                    .get_mut(index as usize)
                    .ok_or_else(|| Error::malformed(offset, format!("local {} out of range", index)))?;
                *slot = value;
            }
            Instruction::GetGlobal(name) => {
                let value = host.get_global(chunk.name_at(name, offset)?)?;
                ctx.stack.push(value);
            }
            Instruction::SetGlobal(name) => {
                let value = ctx.pop(offset)?;
                host.set_global(chunk.name_at(name, offset)?, value);
            }

            // ========== Properties ==========
            Instruction::GetNamed { name, site } => {
                let name = chunk.name_at(name, offset)?;
                let receiver = ctx.pop(offset)?;
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_named(site, &receiver, name);
                }
                ctx.stack.push(ops::get_named(&receiver, name)?);
            }
            Instruction::SetNamed { name, site } => {
                let name = chunk.name_at(name, offset)?;
                let value = ctx.pop(offset)?;
                let receiver = ctx.pop(offset)?;
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_named(site, &receiver, name);
                }
                ops::set_named(host.shapes(), &receiver, name, value)?;
            }
            Instruction::DefineNamed(name) => {
                let name = chunk.name_at(name, offset)?;
                let value = ctx.pop(offset)?;
                let receiver = ctx.peek(offset)?.clone();
                ops::set_named(host.shapes(), &receiver, name, value)?;
            }
            Instruction::LoadElement(site) => {
                let index = ctx.pop(offset)?;
                let receiver = ctx.pop(offset)?;
                let load = ops::load_element(&receiver, &index)?;
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_element(site, &receiver, &index, load.hole_or_oob);
                }
                ctx.stack.push(load.value);
            }
            Instruction::StoreElement(site) => {
                let value = ctx.pop(offset)?;
                let index = ctx.pop(offset)?;
                let receiver = ctx.pop(offset)?;
                let slow = ops::store_element(host.shapes(), &receiver, &index, value)?;
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_element(site, &receiver, &index, slow);
                }
            }
            Instruction::CreateObject => {
                let object = JsObject::new(host.shapes().root());
                ctx.stack.push(Value::new_object(object));
            }
            Instruction::NewArray(len) => {
                ctx.stack.push(Value::new_array(JsArray::with_holes(len as usize)));
            }

            // ========== Operators ==========
            Instruction::Add(site) => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                let result = ops::add(&a, &b);
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_binary(site, &a, &b, Some(&result));
                }
                ctx.stack.push(result);
            }
            Instruction::Arith(op, site) => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                let result = ops::arith(op, &a, &b);
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_binary(site, &a, &b, Some(&result));
                }
                ctx.stack.push(result);
            }
            Instruction::Neg => {
                let a = ctx.pop(offset)?;
                ctx.stack.push(ops::neg(&a));
            }
            Instruction::Compare(op, site) => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                if let Some(feedback) = host.feedback_mut(function, version) {
                    feedback.record_binary(site, &a, &b, None);
                }
                ctx.stack.push(Value::Boolean(ops::compare(op, &a, &b)));
            }
            Instruction::StrictEq => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                ctx.stack.push(Value::Boolean(a.strict_equals(&b)));
            }
            Instruction::StrictNe => {
                let b = ctx.pop(offset)?;
                let a = ctx.pop(offset)?;
                ctx.stack.push(Value::Boolean(!a.strict_equals(&b)));
            }
            Instruction::Not => {
                let a = ctx.pop(offset)?;
                ctx.stack.push(ops::not(&a));
            }

            // ========== Control Flow ==========
            Instruction::Jump(target) => ctx.pc = target,
            Instruction::JumpIfFalse(target) => {
                if !ctx.pop(offset)?.to_boolean() {
                    ctx.pc = target;
                }
            }
            Instruction::JumpIfTrue(target) => {
                if ctx.pop(offset)?.to_boolean() {
                    ctx.pc = target;
                }
            }
            Instruction::Call { function: callee, argc } => {
                let argc = argc as usize;
                if ctx.stack.len() < argc {
                    return Err(Error::malformed(offset, "operand stack underflow"));
                }
                let args = ctx.stack.split_off(ctx.stack.len() - argc);
                let result = host.call(FunctionId(callee as u32), args)?;
                ctx.stack.push(result);
            }
            Instruction::Return => return Ok(Completion::Return(ctx.pop(offset)?)),
            Instruction::ReturnUndefined => return Ok(Completion::Return(Value::Undefined)),
            Instruction::Throw => return Err(Error::Exception(ctx.pop(offset)?)),
            Instruction::Emit => {
                let value = ctx.pop(offset)?;
                host.emit(value);
            }
            Instruction::Yield => {
                let value = ctx.pop(offset)?;
                return Ok(Completion::Yield(value, ctx));
            }
        }
    }
}
