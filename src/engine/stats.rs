//! Engine counters and per-function introspection

use crate::jit::DeoptReason;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// Which tier a function currently routes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Baseline,
    Optimized,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Baseline => write!(f, "baseline"),
            Tier::Optimized => write!(f, "optimized"),
        }
    }
}

/// Snapshot of one function's tiering state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStatus {
    pub name: String,
    pub tier: Tier,
    pub bytecode_version: u32,
    pub invocation_count: u64,
    pub baseline_calls: u64,
    pub optimized_calls: u64,
    pub compilations: u32,
    pub deopt_count: u32,
    pub cooldown_remaining: u32,
    pub never_optimize: bool,
    pub compile_disabled: bool,
    pub compile_pending: bool,
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] v{}: {} invocations ({} baseline, {} optimized), {} compilations, {} deopts",
            self.name,
            self.tier,
            self.bytecode_version,
            self.invocation_count,
            self.baseline_calls,
            self.optimized_calls,
            self.compilations,
            self.deopt_count
        )?;
        if self.cooldown_remaining > 0 {
            write!(f, ", cooldown {}", self.cooldown_remaining)?;
        }
        if self.never_optimize {
            write!(f, ", never optimize")?;
        }
        if self.compile_disabled {
            write!(f, ", compile disabled")?;
        }
        Ok(())
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub functions: usize,
    pub baseline_calls: u64,
    pub optimized_calls: u64,
    pub compilations: u64,
    pub compile_failures: u64,
    /// Finished compilations dropped because the function changed meanwhile
    pub discarded_compilations: u64,
    pub deopts: u64,
    pub deopts_by_reason: HashMap<DeoptReason, u64>,
    /// Optimized code invalidated without a guard failure
    pub invalidations: u64,
    pub cooldowns: u64,
}

impl EngineStats {
    pub(crate) fn record_deopt(&mut self, reason: DeoptReason) {
        self.deopts += 1;
        *self.deopts_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn deopts_for(&self, reason: DeoptReason) -> u64 {
        self.deopts_by_reason.get(&reason).copied().unwrap_or(0)
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Tiering Summary ===")?;
        writeln!(f, "Functions: {}", self.functions)?;
        writeln!(
            f,
            "Calls: {} baseline, {} optimized",
            self.baseline_calls, self.optimized_calls
        )?;
        writeln!(
            f,
            "Compilations: {} succeeded, {} failed, {} discarded",
            self.compilations, self.compile_failures, self.discarded_compilations
        )?;
        write!(f, "Deoptimizations: {}", self.deopts)?;
        let mut reasons: Vec<_> = self.deopts_by_reason.iter().collect();
        reasons.sort_by_key(|(reason, _)| reason.to_string());
        for (i, (reason, count)) in reasons.into_iter().enumerate() {
            write!(f, "{}{} {}", if i == 0 { " (" } else { ", " }, count, reason)?;
        }
        if !self.deopts_by_reason.is_empty() {
            write!(f, ")")?;
        }
        writeln!(f)?;
        writeln!(f, "Invalidations: {}", self.invalidations)?;
        writeln!(f, "Cooldowns: {}", self.cooldowns)?;
        Ok(())
    }
}
