//! Execution dispatcher
//!
//! The [`Engine`] owns every [`FunctionUnit`], the global cells, the shape
//! table and the effect log. [`Engine::call`] is the single routing point:
//! it installs finished background compilations, lets the tier-up scheduler
//! look at the invocation, and runs whichever tier the unit's [`CodeTier`]
//! names. Guard failures are turned into baseline resumptions before `call`
//! returns, so callers only ever see program results and program errors.
//!
//! Tier transitions assign `FunctionUnit::code` as their final step.

mod generators;
mod globals;
mod intrinsics;
mod stats;

pub use generators::IterResult;
pub use globals::Globals;
pub use stats::{EngineStats, FunctionStatus, Tier};

use crate::bytecode::analysis::BytecodeAnalysis;
use crate::bytecode::Chunk;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::interpreter::{self, Completion, ExecutionContext, Host};
use crate::jit::compiler::{self, CompileRequest, CompilerOptions};
use crate::jit::concurrent::{CompileQueue, CompileResult};
use crate::jit::deopt::{self, DeoptEvent, DeoptPolicy, DeoptReason};
use crate::jit::executor::{self, ExecOutcome};
use crate::jit::feedback::FeedbackVector;
use crate::jit::scheduler::{TierState, TierUpDecision, TierUpScheduler};
use crate::jit::OptimizedCode;
use crate::runtime::{ops, JsObject, ShapeTable, Value};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Stable identity of a defined function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// The routing-table entry of a function
#[derive(Debug, Clone)]
pub enum CodeTier {
    Baseline,
    Optimized(Rc<OptimizedCode>),
}

impl CodeTier {
    pub fn tier(&self) -> Tier {
        match self {
            CodeTier::Baseline => Tier::Baseline,
            CodeTier::Optimized(_) => Tier::Optimized,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct UnitStats {
    baseline_calls: u64,
    optimized_calls: u64,
    compilations: u32,
}

/// One compilable function
pub struct FunctionUnit {
    id: FunctionId,
    chunk: Arc<Chunk>,
    /// Bumped whenever the bytecode is replaced
    bytecode_version: u32,
    feedback: FeedbackVector,
    tier: TierState,
    code: CodeTier,
    stats: UnitStats,
}

impl FunctionUnit {
    fn new(id: FunctionId, chunk: Chunk, max_polymorphism: usize) -> Self {
        Self {
            id,
            feedback: FeedbackVector::new(&chunk.call_sites, max_polymorphism),
            chunk: Arc::new(chunk),
            bytecode_version: 0,
            tier: TierState::default(),
            code: CodeTier::Baseline,
            stats: UnitStats::default(),
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.chunk.name
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    pub fn code(&self) -> &CodeTier {
        &self.code
    }

    /// Drop optimized code, if any; returns whether there was some
    fn revert_to_baseline(&mut self) -> bool {
        match std::mem::replace(&mut self.code, CodeTier::Baseline) {
            CodeTier::Optimized(code) => {
                code.invalidate();
                true
            }
            CodeTier::Baseline => false,
        }
    }
}

/// The tiered execution engine
pub struct Engine {
    config: EngineConfig,
    shapes: ShapeTable,
    functions: Vec<FunctionUnit>,
    globals: Globals,
    effects: Vec<Value>,
    scheduler: TierUpScheduler,
    policy: DeoptPolicy,
    queue: Option<CompileQueue>,
    depth: usize,
    stats: EngineStats,
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_queue(EngineConfig::default(), None)
    }
}

impl Engine {
    /// Create an engine; starts the compiler thread when concurrent compilation is on
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let queue = if config.concurrent_compilation {
            Some(CompileQueue::new()?)
        } else {
            None
        };
        Ok(Self::with_queue(config, queue))
    }

    fn with_queue(config: EngineConfig, queue: Option<CompileQueue>) -> Self {
        Self {
            scheduler: TierUpScheduler::new(config.tier_up_threshold as u64, config.max_optimizable_polymorphism),
            policy: DeoptPolicy::new(config.deopt_retry_budget, config.cooldown_invocations),
            config,
            shapes: ShapeTable::new(),
            functions: Vec::new(),
            globals: Globals::new(),
            effects: Vec::new(),
            queue,
            depth: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========== Functions ==========

    /// Id the next [`define`](Self::define) will return, for self-recursive chunks
    pub fn next_function_id(&self) -> FunctionId {
        FunctionId(self.functions.len() as u32)
    }

    /// Register a function. The bytecode is validated up front.
    pub fn define(&mut self, chunk: Chunk) -> Result<FunctionId> {
        BytecodeAnalysis::analyze(&chunk)?;
        let id = self.next_function_id();
        debug!(function = %chunk.name, %id, "defined");
        self.functions
            .push(FunctionUnit::new(id, chunk, self.config.max_polymorphism));
        self.stats.functions = self.functions.len();
        Ok(id)
    }

    /// Swap in new bytecode: feedback and tiering state start over and any
    /// in-flight compilation for the old bytecode is discarded on arrival
    pub fn replace_bytecode(&mut self, id: FunctionId, chunk: Chunk) -> Result<()> {
        BytecodeAnalysis::analyze(&chunk)?;
        let max_polymorphism = self.config.max_polymorphism;
        let unit = self.unit_mut(id)?;
        let had_code = unit.revert_to_baseline();
        unit.bytecode_version += 1;
        unit.feedback = FeedbackVector::new(&chunk.call_sites, max_polymorphism);
        unit.chunk = Arc::new(chunk);
        unit.tier = TierState {
            never_optimize: unit.tier.never_optimize,
            deopt_count: unit.tier.deopt_count,
            ..TierState::default()
        };
        debug!(function = %unit.chunk.name, version = unit.bytecode_version, "bytecode replaced");
        if had_code {
            self.stats.invalidations += 1;
        }
        Ok(())
    }

    pub fn function(&self, id: FunctionId) -> Result<&FunctionUnit> {
        self.functions.get(id.0 as usize).ok_or(Error::UnknownFunction(id))
    }

    fn unit_mut(&mut self, id: FunctionId) -> Result<&mut FunctionUnit> {
        self.functions.get_mut(id.0 as usize).ok_or(Error::UnknownFunction(id))
    }

    // ========== Globals and effects ==========

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Write a global; optimized code that folded its old value is invalidated
    pub fn set_global(&mut self, name: &str, value: Value) {
        for code in self.globals.set(name, value) {
            debug!(function = %code.unit.name, global = name, "global changed, invalidating");
            self.invalidate(&code);
        }
    }

    /// Values passed to `Emit`, in order
    pub fn effects(&self) -> &[Value] {
        &self.effects
    }

    pub fn take_effects(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.effects)
    }

    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Build a plain object, adding properties in order (which fixes its shape)
    pub fn new_object(&self, properties: &[(&str, Value)]) -> Value {
        let mut object = JsObject::new(self.shapes.root());
        for (name, value) in properties {
            ops::define_property(&self.shapes, &mut object, name, value.clone());
        }
        Value::new_object(object)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Invalidate `code` and unroute it if it is still installed
    fn invalidate(&mut self, code: &Rc<OptimizedCode>) {
        if !code.is_valid() {
            return;
        }
        code.invalidate();
        self.stats.invalidations += 1;
        if let Some(unit) = self.functions.get_mut(code.unit.function.0 as usize) {
            if matches!(&unit.code, CodeTier::Optimized(c) if Rc::ptr_eq(c, code)) {
                unit.code = CodeTier::Baseline;
            }
        }
    }

    // ========== Dispatch ==========

    /// Call a function through whichever tier is current
    pub fn call(&mut self, id: FunctionId, args: Vec<Value>) -> Result<Value> {
        if self.depth >= self.config.max_call_depth {
            return Err(Error::range_error("Maximum call stack size exceeded"));
        }
        self.depth += 1;
        let result = self.dispatch(id, args);
        self.depth -= 1;
        if let Err(e) = &result {
            if e.is_fatal() && self.depth == 0 {
                error!(%id, error = %e, "fatal engine error");
            }
        }
        result
    }

    fn dispatch(&mut self, id: FunctionId, args: Vec<Value>) -> Result<Value> {
        self.install_finished_jobs();

        let unit = self
            .functions
            .get_mut(id.0 as usize)
            .ok_or(Error::UnknownFunction(id))?;
        let optimized = matches!(unit.code, CodeTier::Optimized(_));
        match self.scheduler.on_invocation(&mut unit.tier, &unit.feedback, optimized) {
            TierUpDecision::Compile => self.request_compile(id)?,
            TierUpDecision::Defer(reason) => trace!(function = %unit.chunk.name, %reason, "tier-up deferred"),
        }

        let unit = self.unit_mut(id)?;
        if unit.chunk.is_generator() {
            return Ok(generators::create(id, args));
        }
        match unit.code.clone() {
            CodeTier::Optimized(code) => {
                unit.stats.optimized_calls += 1;
                self.stats.optimized_calls += 1;
                self.run_optimized(&code, &args)
            }
            CodeTier::Baseline => {
                unit.stats.baseline_calls += 1;
                let ctx = ExecutionContext::new(id, Arc::clone(&unit.chunk), unit.bytecode_version, args);
                self.stats.baseline_calls += 1;
                let completion = interpreter::execute(self, ctx)?;
                Self::returned(completion)
            }
        }
    }

    fn returned(completion: Completion) -> Result<Value> {
        match completion {
            Completion::Return(value) => Ok(value),
            Completion::Yield(_, ctx) => Err(Error::malformed(ctx.pc, "yield outside a generator")),
        }
    }

    fn run_optimized(&mut self, code: &Rc<OptimizedCode>, args: &[Value]) -> Result<Value> {
        match executor::run(self, code, args)? {
            ExecOutcome::Return(value) => Ok(value),
            ExecOutcome::Deopt(event) => {
                let completion = self.apply_deopt(event, code)?;
                Self::returned(completion)
            }
            ExecOutcome::Suspend { frame, .. } => Err(Error::malformed(frame.bytecode_offset, "yield outside a generator")),
        }
    }

    /// Handle a guard failure: unroute the code, account for the deopt,
    /// rebuild the interpreter frame and finish the activation in baseline.
    /// Re-executing the failing instruction in baseline records the kind
    /// that broke the speculation.
    pub(crate) fn apply_deopt(&mut self, event: DeoptEvent, code: &Rc<OptimizedCode>) -> Result<Completion> {
        let offset = event.bytecode_offset();
        if code.is_valid() {
            code.invalidate();
        }
        let unit = self
            .functions
            .get_mut(event.function.0 as usize)
            .ok_or(Error::UnknownFunction(event.function))?;
        if matches!(&unit.code, CodeTier::Optimized(c) if Rc::ptr_eq(c, code)) {
            unit.code = CodeTier::Baseline;
        }
        debug!(
            function = %unit.chunk.name,
            reason = %event.reason,
            offset,
            site = ?event.site,
            "deoptimized"
        );
        // lazy deopts were already accounted for when the code was invalidated
        let cooldown = event.reason != DeoptReason::CodeInvalidated
            && self.policy.record(&code.unit.name, &mut unit.tier, offset);
        self.stats.record_deopt(event.reason);
        if cooldown {
            self.stats.cooldowns += 1;
        }

        let (locals, stack) = deopt::materialize(&self.shapes, &event.frame)?;
        let ctx = ExecutionContext {
            function: event.function,
            chunk: Arc::clone(&code.chunk),
            bytecode_version: code.unit.bytecode_version,
            pc: offset,
            locals,
            stack,
        };
        interpreter::resume_from_deopt(self, ctx)
    }

    // ========== Compilation ==========

    fn compile_request(&self, id: FunctionId) -> Result<CompileRequest> {
        let unit = self.function(id)?;
        Ok(CompileRequest {
            function: id,
            bytecode_version: unit.bytecode_version,
            chunk: Arc::clone(&unit.chunk),
            feedback: unit.feedback.snapshot(),
            globals: self.globals.snapshot(),
            options: CompilerOptions {
                escape_analysis: self.config.enable_escape_analysis,
            },
        })
    }

    fn request_compile(&mut self, id: FunctionId) -> Result<()> {
        let request = self.compile_request(id)?;
        match &self.queue {
            Some(queue) => {
                queue.submit(request);
                self.unit_mut(id)?.tier.pending = true;
            }
            None => {
                let outcome = compiler::compile(&request);
                self.install(CompileResult {
                    function: id,
                    bytecode_version: request.bytecode_version,
                    outcome,
                });
            }
        }
        Ok(())
    }

    fn install_finished_jobs(&mut self) {
        let results = match &self.queue {
            Some(queue) => queue.drain_results(),
            None => return,
        };
        for result in results {
            self.install(result);
        }
    }

    /// Route a finished compilation, unless the function moved on meanwhile
    fn install(&mut self, result: CompileResult) {
        let Some(unit) = self.functions.get_mut(result.function.0 as usize) else {
            return;
        };
        unit.tier.pending = false;
        if result.bytecode_version != unit.bytecode_version || unit.tier.never_optimize {
            debug!(function = %unit.chunk.name, "discarding stale compilation");
            self.stats.discarded_compilations += 1;
            return;
        }
        let compiled = match result.outcome {
            Ok(compiled) => compiled,
            Err(failure) => {
                debug!(function = %unit.chunk.name, %failure, "compilation failed, staying on baseline");
                unit.tier.compile_disabled = true;
                self.stats.compile_failures += 1;
                return;
            }
        };

        let code = Rc::new(OptimizedCode::new(compiled, Arc::clone(&unit.chunk)));
        for (name, version) in &code.unit.global_dependencies {
            if !self.globals.add_dependency(name, *version, &code) {
                debug!(function = %unit.chunk.name, global = %name, "global changed during compilation");
                code.invalidate();
                self.stats.discarded_compilations += 1;
                return;
            }
        }
        debug!(
            function = %unit.chunk.name,
            guards = code.unit.guards.len(),
            "installed optimized code"
        );
        unit.stats.compilations += 1;
        self.stats.compilations += 1;
        unit.code = CodeTier::Optimized(code);
    }
}

impl Host for Engine {
    fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    fn feedback_mut(&mut self, function: FunctionId, version: u32) -> Option<&mut FeedbackVector> {
        self.functions
            .get_mut(function.0 as usize)
            .filter(|unit| unit.bytecode_version == version)
            .map(|unit| &mut unit.feedback)
    }

    fn get_global(&self, name: &str) -> Result<Value> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| Error::reference_error(format!("{} is not defined", name)))
    }

    fn set_global(&mut self, name: &str, value: Value) {
        Engine::set_global(self, name, value);
    }

    fn global_version(&self, name: &str) -> Option<u32> {
        self.globals.version(name)
    }

    fn call(&mut self, function: FunctionId, args: Vec<Value>) -> Result<Value> {
        Engine::call(self, function, args)
    }

    fn emit(&mut self, value: Value) {
        self.effects.push(value);
    }
}
