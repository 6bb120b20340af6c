//! Test and diagnostic hooks
//!
//! These let a host script the tiering state machine directly: force or
//! forbid optimization, throw away feedback, deoptimize on demand and wait
//! for background compilation.

use super::{CodeTier, Engine, FunctionId, FunctionStatus};
use crate::error::Result;
use crate::jit::feedback::FeedbackVector;
use tracing::debug;

impl Engine {
    /// Reset the invocation counter and feedback so the next warm-up starts clean.
    /// Deopt history and any running cooldown are kept.
    pub fn prepare_for_optimization(&mut self, id: FunctionId) -> Result<()> {
        let unit = self.unit_mut(id)?;
        unit.tier.invocation_count = 0;
        unit.feedback.clear();
        Ok(())
    }

    /// Attempt compilation on the next call regardless of the threshold
    pub fn optimize_on_next_call(&mut self, id: FunctionId) -> Result<()> {
        let unit = self.unit_mut(id)?;
        debug!(function = %unit.chunk.name, "optimization forced on next call");
        unit.tier.optimize_on_next_call = true;
        Ok(())
    }

    /// Whether `id` currently routes to valid optimized code
    pub fn is_optimized(&self, id: FunctionId) -> bool {
        self.function(id)
            .map(|unit| matches!(&unit.code, CodeTier::Optimized(code) if code.is_valid()))
            .unwrap_or(false)
    }

    /// Exclude `id` from optimization for good; existing code is dropped
    pub fn never_optimize(&mut self, id: FunctionId) -> Result<()> {
        let unit = self.unit_mut(id)?;
        unit.tier.never_optimize = true;
        unit.tier.optimize_on_next_call = false;
        if unit.revert_to_baseline() {
            self.stats.invalidations += 1;
        }
        Ok(())
    }

    /// Forget everything learned about `id` and drop its optimized code
    pub fn clear_function_feedback(&mut self, id: FunctionId) -> Result<()> {
        let unit = self.unit_mut(id)?;
        unit.feedback.clear();
        unit.tier.invocation_count = 0;
        if unit.revert_to_baseline() {
            self.stats.invalidations += 1;
        }
        Ok(())
    }

    /// Drop optimized code for `id` without a guard failure. Activations
    /// already running it bail out at their next call boundary.
    pub fn deoptimize_now(&mut self, id: FunctionId) -> Result<()> {
        let unit = self.unit_mut(id)?;
        if unit.revert_to_baseline() {
            debug!(function = %unit.chunk.name, "deoptimized on request");
            self.stats.invalidations += 1;
        }
        Ok(())
    }

    /// Block until background compilation is idle and install the results
    pub fn finalize_optimization(&mut self) {
        if let Some(queue) = &self.queue {
            queue.wait_idle();
        }
        self.install_finished_jobs();
    }

    /// Compile jobs queued or running in the background
    pub fn pending_compilations(&self) -> usize {
        self.queue.as_ref().map_or(0, |queue| queue.pending())
    }

    pub fn status(&self, id: FunctionId) -> Result<FunctionStatus> {
        let unit = self.function(id)?;
        Ok(FunctionStatus {
            name: unit.chunk.name.clone(),
            tier: unit.code.tier(),
            bytecode_version: unit.bytecode_version,
            invocation_count: unit.tier.invocation_count,
            baseline_calls: unit.stats.baseline_calls,
            optimized_calls: unit.stats.optimized_calls,
            compilations: unit.stats.compilations,
            deopt_count: unit.tier.deopt_count,
            cooldown_remaining: unit.tier.cooldown_remaining,
            never_optimize: unit.tier.never_optimize,
            compile_disabled: unit.tier.compile_disabled,
            compile_pending: unit.tier.pending,
        })
    }

    /// The live feedback vector of `id`
    pub fn feedback(&self, id: FunctionId) -> Result<&FeedbackVector> {
        Ok(&self.function(id)?.feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ChunkBuilder;
    use crate::config::EngineConfig;
    use crate::engine::Tier;
    use crate::runtime::Value;

    fn setup() -> (Engine, FunctionId) {
        let mut engine = Engine::new(EngineConfig::default().with_tier_up_threshold(1000)).unwrap();
        let mut b = ChunkBuilder::new("mul", 2);
        b.get_local(0).get_local(1).mul().ret();
        let id = engine.define(b.finish().unwrap()).unwrap();
        (engine, id)
    }

    fn two() -> Vec<Value> {
        vec![Value::Number(2.0), Value::Number(3.0)]
    }

    #[test]
    fn test_optimize_on_next_call() {
        let (mut engine, id) = setup();
        engine.call(id, two()).unwrap();
        engine.optimize_on_next_call(id).unwrap();
        assert_eq!(engine.call(id, two()).unwrap(), Value::Number(6.0));
        assert!(engine.is_optimized(id));
        assert_eq!(engine.status(id).unwrap().tier, Tier::Optimized);
    }

    #[test]
    fn test_never_optimize_wins_over_forcing() {
        let (mut engine, id) = setup();
        engine.call(id, two()).unwrap();
        engine.optimize_on_next_call(id).unwrap();
        engine.never_optimize(id).unwrap();
        engine.optimize_on_next_call(id).unwrap();
        engine.call(id, two()).unwrap();
        assert!(!engine.is_optimized(id));
        assert!(engine.status(id).unwrap().never_optimize);
    }

    #[test]
    fn test_deoptimize_now() {
        let (mut engine, id) = setup();
        engine.call(id, two()).unwrap();
        engine.optimize_on_next_call(id).unwrap();
        engine.call(id, two()).unwrap();
        engine.deoptimize_now(id).unwrap();
        assert!(!engine.is_optimized(id));
        assert_eq!(engine.stats().invalidations, 1);
        assert_eq!(engine.call(id, two()).unwrap(), Value::Number(6.0));
    }

    #[test]
    fn test_clear_feedback_forgets_samples() {
        let (mut engine, id) = setup();
        engine.call(id, two()).unwrap();
        assert!(engine.feedback(id).unwrap().slots()[0].sample_count > 0);
        engine.clear_function_feedback(id).unwrap();
        assert_eq!(engine.feedback(id).unwrap().slots()[0].sample_count, 0);
        assert_eq!(engine.status(id).unwrap().invocation_count, 0);
    }

    #[test]
    fn test_forced_without_feedback_still_runs() {
        let (mut engine, id) = setup();
        engine.optimize_on_next_call(id).unwrap();
        // the uninitialized site compiles to an unconditional deopt
        assert_eq!(engine.call(id, two()).unwrap(), Value::Number(6.0));
        assert!(!engine.is_optimized(id));
        assert_eq!(engine.status(id).unwrap().deopt_count, 1);
    }
}
