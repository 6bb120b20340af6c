//! Speculative compiler
//!
//! Turns a function's bytecode plus a feedback snapshot into an
//! [`OptimizedUnit`]. Arithmetic, comparisons and property accesses are
//! specialized to the kinds the baseline tier observed, each speculation
//! protected by a guard whose frame state lets the deoptimizer resume the
//! interpreter at the protected instruction.
//!
//! A [`CompileRequest`] owns everything the compiler reads, so it can be
//! moved to the background compile thread. The compiler never touches live
//! engine state.

mod escape;
mod lower;

pub use escape::{AbstractValue, AllocId, EscapeAnalysis};

use super::feedback::FeedbackVector;
use super::ir::{ConstValue, OptimizedUnit};
use crate::bytecode::analysis::BytecodeAnalysis;
use crate::bytecode::{Chunk, ChunkFlags, Instruction};
use crate::engine::FunctionId;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a function could not be compiled. Never surfaced to the program;
/// the function stays on the baseline tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileFailure {
    #[error("function uses a construct the optimizing tier does not support")]
    UnsupportedConstruct,

    #[error("yield inside a loop at offset {offset}")]
    YieldInLoop { offset: usize },

    #[error("bytecode rejected: {0}")]
    InvalidBytecode(String),

    #[error("too many registers ({0})")]
    TooManyRegisters(usize),

    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// A global cell as seen at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSnapshot {
    pub version: u32,
    /// Set when the cell is considered constant and holds a primitive
    pub constant: Option<ConstValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerOptions {
    pub escape_analysis: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { escape_analysis: true }
    }
}

/// Everything the compiler needs, detached from the engine
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub function: FunctionId,
    pub bytecode_version: u32,
    pub chunk: Arc<Chunk>,
    pub feedback: FeedbackVector,
    pub globals: HashMap<String, GlobalSnapshot>,
    pub options: CompilerOptions,
}

/// Compile one function
pub fn compile(request: &CompileRequest) -> Result<OptimizedUnit, CompileFailure> {
    let chunk = &request.chunk;
    if chunk.flags.contains(ChunkFlags::UNSUPPORTED_CONSTRUCT) {
        return Err(CompileFailure::UnsupportedConstruct);
    }
    let analysis = BytecodeAnalysis::analyze(chunk).map_err(|e| CompileFailure::InvalidBytecode(e.to_string()))?;

    // generator frames are only saved at yields outside loops
    if chunk.is_generator() {
        if let Some((offset, _)) = analysis
            .instructions
            .iter()
            .find(|(offset, ins)| matches!(ins, Instruction::Yield) && analysis.in_loop(*offset))
        {
            return Err(CompileFailure::YieldInLoop { offset: *offset });
        }
    }

    let escape = EscapeAnalysis::analyze(chunk, &analysis, request.options.escape_analysis);
    let unit = lower::lower(request, &analysis, &escape)?;
    debug!(
        function = %unit.name,
        instructions = unit.code.len(),
        guards = unit.guards.len(),
        frame_states = unit.frame_states.len(),
        elided = escape.elided_count(),
        "compiled"
    );
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ChunkBuilder;
    use crate::jit::deopt::DeoptReason;
    use crate::jit::ir::OptInstr;
    use crate::runtime::Value;

    fn request(chunk: Chunk, feedback: FeedbackVector) -> CompileRequest {
        CompileRequest {
            function: FunctionId(0),
            bytecode_version: 0,
            chunk: Arc::new(chunk),
            feedback,
            globals: HashMap::default(),
            options: CompilerOptions::default(),
        }
    }

    fn add_chunk() -> Chunk {
        let mut b = ChunkBuilder::new("add", 2);
        b.get_local(0).get_local(1).add().ret();
        b.finish().unwrap()
    }

    #[test]
    fn test_smi_feedback_specializes_to_int_add() {
        let chunk = add_chunk();
        let mut fb = FeedbackVector::new(&chunk.call_sites, 4);
        fb.record_binary(0, &Value::Number(1.0), &Value::Number(2.0), Some(&Value::Number(3.0)));
        let unit = compile(&request(chunk, fb)).unwrap();
        assert!(unit.code.iter().any(|i| matches!(i, OptInstr::IntBinary { .. })));
        assert_eq!(
            unit.code.iter().filter(|i| matches!(i, OptInstr::CheckSmi { .. })).count(),
            2
        );
    }

    #[test]
    fn test_number_feedback_specializes_to_float_add() {
        let chunk = add_chunk();
        let mut fb = FeedbackVector::new(&chunk.call_sites, 4);
        fb.record_binary(0, &Value::Number(1.5), &Value::Number(2.0), Some(&Value::Number(3.5)));
        let unit = compile(&request(chunk, fb)).unwrap();
        assert!(unit.code.iter().any(|i| matches!(i, OptInstr::FloatBinary { .. })));
    }

    #[test]
    fn test_missing_feedback_becomes_deopt() {
        let chunk = add_chunk();
        let fb = FeedbackVector::new(&chunk.call_sites, 4);
        let unit = compile(&request(chunk, fb)).unwrap();
        assert!(unit.code.iter().any(|i| matches!(
            i,
            OptInstr::Deopt {
                reason: DeoptReason::InsufficientFeedback,
                ..
            }
        )));
    }

    #[test]
    fn test_unsupported_construct_declined() {
        let mut b = ChunkBuilder::new("f", 0);
        b.set_flags(ChunkFlags::UNSUPPORTED_CONSTRUCT);
        b.ret_undefined();
        let chunk = b.finish().unwrap();
        let fb = FeedbackVector::new(&chunk.call_sites, 4);
        assert_eq!(compile(&request(chunk, fb)).unwrap_err(), CompileFailure::UnsupportedConstruct);
    }

    #[test]
    fn test_yield_in_loop_declined() {
        let mut b = ChunkBuilder::new("g", 0);
        b.generator();
        let top = b.here();
        b.number(1.0).yield_value().pop().jump(top);
        let chunk = b.finish().unwrap();
        let fb = FeedbackVector::new(&chunk.call_sites, 4);
        assert!(matches!(
            compile(&request(chunk, fb)),
            Err(CompileFailure::YieldInLoop { .. })
        ));
    }

    #[test]
    fn test_frame_states_are_shared() {
        // two guards at the same instruction share one frame state
        let chunk = add_chunk();
        let mut fb = FeedbackVector::new(&chunk.call_sites, 4);
        fb.record_binary(0, &Value::Number(1.0), &Value::Number(2.0), Some(&Value::Number(3.0)));
        let unit = compile(&request(chunk, fb)).unwrap();
        assert_eq!(unit.guards.len(), 1);
        assert_eq!(unit.frame_states.len(), 1);
    }
}
