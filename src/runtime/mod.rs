//! Runtime value model
//!
//! Values, object shapes and the operator semantics both execution tiers
//! share.

pub mod ops;
pub mod shape;
mod value;

pub use shape::{Shape, ShapeId, ShapeTable};
pub use value::{format_number, GeneratorObject, GeneratorState, JsArray, JsObject, Value};
