//! tierjit: a tiered execution engine
//!
//! Functions start in a baseline bytecode interpreter that records type
//! feedback at every operation site. Once a function is hot, a speculative
//! compiler turns bytecode plus feedback into an optimized unit whose fast
//! paths are protected by guards. A failed guard deoptimizes: the live state
//! is rebuilt from the guard's frame state and execution continues in the
//! interpreter as if the optimized code had never run.
//!
//! # Quick Start
//!
//! ```no_run
//! use tierjit::{ChunkBuilder, Engine, EngineConfig, Value};
//!
//! fn main() -> tierjit::Result<()> {
//!     let mut engine = Engine::new(EngineConfig::default().with_tier_up_threshold(10))?;
//!     let mut b = ChunkBuilder::new("add", 2);
//!     b.get_local(0).get_local(1).add().ret();
//!     let add = engine.define(b.finish()?)?;
//!     for i in 0..20 {
//!         engine.call(add, vec![Value::Number(i as f64), Value::Number(1.0)])?;
//!     }
//!     assert!(engine.is_optimized(add));
//!     println!("{}", engine.stats());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Input** | [`bytecode`] |
//! | **Baseline** | [`runtime`], [`interpreter`] |
//! | **Optimizing** | [`jit`] |
//! | **Dispatch** | [`engine`], [`config`], [`error`](Error) |
// Clippy configuration for tierjit.
//
// - arc_with_non_send_sync: chunks are shared with the compiler thread while
//   runtime values stay Rc<RefCell> on the engine thread
// - new_without_default: ShapeTable and friends need their root entries
// - enum_variant_names: error kinds follow JS naming conventions
#![allow(clippy::arc_with_non_send_sync)]
#![allow(clippy::new_without_default)]
#![allow(clippy::enum_variant_names)]

pub mod bytecode;
pub mod config;
pub mod engine;
pub mod interpreter;
pub mod jit;
pub mod prelude;
pub mod runtime;

mod error;

pub use bytecode::{Chunk, ChunkBuilder, ChunkFlags};
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, FunctionId, FunctionStatus, IterResult, Tier};
pub use error::{Error, ErrorKind, Result};
pub use runtime::Value;

/// tierjit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
