//! Optimizing tier
//!
//! Type feedback, the tier-up policy, the speculative compiler, the
//! optimized-code executor and deoptimization. The engine drives these
//! pieces; none of them owns engine state.

//! **Status:** ✅ Complete — speculative compilation with guard-based deoptimization

pub mod compiler;
pub mod concurrent;
pub mod deopt;
pub mod executor;
pub mod feedback;
pub mod ir;
pub mod scheduler;

pub use compiler::{compile, CompileFailure, CompileRequest, CompilerOptions, GlobalSnapshot};
pub use deopt::{DeoptEvent, DeoptPolicy, DeoptReason};
pub use executor::ExecOutcome;
pub use feedback::{Cardinality, FeedbackSlot, FeedbackVector, Kind};
pub use ir::OptimizedUnit;
pub use scheduler::{DeferReason, TierState, TierUpDecision, TierUpScheduler};

use crate::bytecode::Chunk;
use std::cell::Cell;
use std::sync::Arc;

/// An installed optimized unit.
///
/// Invalidation only clears the flag: activations already running this code
/// keep their reference and notice at their next lazy deopt point.
#[derive(Debug)]
pub struct OptimizedCode {
    pub unit: OptimizedUnit,
    /// Bytecode the unit was compiled from; deopts resume in it
    pub chunk: Arc<Chunk>,
    valid: Cell<bool>,
}

impl OptimizedCode {
    pub fn new(unit: OptimizedUnit, chunk: Arc<Chunk>) -> Self {
        Self {
            unit,
            chunk,
            valid: Cell::new(true),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub fn invalidate(&self) {
        self.valid.set(false);
    }
}
