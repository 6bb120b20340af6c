//! Prelude module for convenient imports
//!
//! ```no_run
//! use tierjit::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let mut engine = Engine::new(EngineConfig::default())?;
//!     let mut b = ChunkBuilder::new("one", 0);
//!     b.number(1.0).ret();
//!     let one = engine.define(b.finish()?)?;
//!     println!("{}", engine.call(one, vec![])?);
//!     Ok(())
//! }
//! ```

// Engine and host API
pub use crate::engine::{Engine, EngineStats, FunctionId, FunctionStatus, IterResult, Tier};
pub use crate::config::EngineConfig;

// Error handling
pub use crate::error::{Error, ErrorKind, Result};

// Values
pub use crate::runtime::Value;

// Bytecode construction
pub use crate::bytecode::{Chunk, ChunkBuilder, ChunkFlags, Label};

// Tiering internals
pub use crate::jit::{DeoptReason, Kind, TierUpDecision};
