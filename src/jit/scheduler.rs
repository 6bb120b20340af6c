//! Tier-up scheduling
//!
//! Decides, once per baseline invocation and in constant time, whether a
//! function should be handed to the speculative compiler.

use super::feedback::FeedbackVector;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// Per-function tiering counters and flags
#[derive(Debug, Clone, Default)]
pub struct TierState {
    /// Baseline invocations since the last reset
    pub invocation_count: u64,
    /// Permanently excluded from optimization
    pub never_optimize: bool,
    /// Attempt compilation on the next call regardless of the threshold
    pub optimize_on_next_call: bool,
    /// The compiler declined this bytecode
    pub compile_disabled: bool,
    /// A background compile job is in flight
    pub pending: bool,
    /// Baseline invocations left before tier-up is considered again
    pub cooldown_remaining: u32,
    /// Deopts per bytecode offset since the last cooldown
    pub site_deopts: HashMap<usize, u32>,
    /// Deopts over the function's lifetime
    pub deopt_count: u32,
}

/// Why a function stays on its current tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    NeverOptimize,
    AlreadyOptimized,
    Cooldown { remaining: u32 },
    CompileDisabled,
    Pending,
    BelowThreshold,
    Megamorphic { sites: usize },
    TooPolymorphic { arity: usize },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::NeverOptimize => write!(f, "never optimize"),
            DeferReason::AlreadyOptimized => write!(f, "already optimized"),
            DeferReason::Cooldown { remaining } => write!(f, "cooldown ({} calls left)", remaining),
            DeferReason::CompileDisabled => write!(f, "compile failed previously"),
            DeferReason::Pending => write!(f, "compile pending"),
            DeferReason::BelowThreshold => write!(f, "below threshold"),
            DeferReason::Megamorphic { sites } => write!(f, "{} megamorphic site(s)", sites),
            DeferReason::TooPolymorphic { arity } => write!(f, "polymorphism {} too high", arity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierUpDecision {
    Compile,
    Defer(DeferReason),
}

/// Tier-up policy
#[derive(Debug, Clone)]
pub struct TierUpScheduler {
    threshold: u64,
    max_optimizable_polymorphism: usize,
}

impl TierUpScheduler {
    pub fn new(threshold: u64, max_optimizable_polymorphism: usize) -> Self {
        Self {
            threshold,
            max_optimizable_polymorphism,
        }
    }

    /// Count an invocation and decide whether to compile.
    ///
    /// The never-optimize override is checked before any counter logic.
    /// A forced request survives deferral and is consumed only by a
    /// `Compile` decision.
    pub fn on_invocation(&self, state: &mut TierState, feedback: &FeedbackVector, optimized: bool) -> TierUpDecision {
        if state.never_optimize {
            return TierUpDecision::Defer(DeferReason::NeverOptimize);
        }
        if optimized {
            return TierUpDecision::Defer(DeferReason::AlreadyOptimized);
        }
        state.invocation_count += 1;
        if state.cooldown_remaining > 0 {
            state.cooldown_remaining -= 1;
            return TierUpDecision::Defer(DeferReason::Cooldown {
                remaining: state.cooldown_remaining,
            });
        }
        if state.compile_disabled {
            return TierUpDecision::Defer(DeferReason::CompileDisabled);
        }
        if state.pending {
            return TierUpDecision::Defer(DeferReason::Pending);
        }
        if !state.optimize_on_next_call && state.invocation_count < self.threshold {
            return TierUpDecision::Defer(DeferReason::BelowThreshold);
        }
        if feedback.megamorphic_sites() > 0 {
            return TierUpDecision::Defer(DeferReason::Megamorphic {
                sites: feedback.megamorphic_sites(),
            });
        }
        if feedback.widest_polymorphism() > self.max_optimizable_polymorphism {
            return TierUpDecision::Defer(DeferReason::TooPolymorphic {
                arity: feedback.widest_polymorphism(),
            });
        }
        state.optimize_on_next_call = false;
        TierUpDecision::Compile
    }
}
