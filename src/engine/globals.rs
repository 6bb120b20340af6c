//! Global variable cells
//!
//! A cell starts out constant. While it is constant, optimized code may fold
//! its value and registers itself as a dependent. The first write of a
//! different value makes the cell mutable for good, bumps its version and
//! hands the dependents back to the engine for invalidation.

use crate::jit::compiler::GlobalSnapshot;
use crate::jit::ir::ConstValue;
use crate::jit::OptimizedCode;
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Constant,
    Mutable,
}

struct GlobalCell {
    value: Value,
    version: u32,
    state: CellState,
    dependents: Vec<Weak<OptimizedCode>>,
}

/// Same value, telling `-0` from `0` and treating NaN as equal to itself
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            (x.is_nan() && y.is_nan()) || (x == y && x.is_sign_negative() == y.is_sign_negative())
        }
        _ => a.strict_equals(b),
    }
}

#[derive(Default)]
pub struct Globals {
    cells: HashMap<String, GlobalCell>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.cells.get(name).map(|c| &c.value)
    }

    pub fn version(&self, name: &str) -> Option<u32> {
        self.cells.get(name).map(|c| c.version)
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.cells.get(name).is_some_and(|c| c.state == CellState::Constant)
    }

    /// Write a global; returns optimized code that depended on the old value
    pub fn set(&mut self, name: &str, value: Value) -> Vec<Rc<OptimizedCode>> {
        let Some(cell) = self.cells.get_mut(name) else {
            self.cells.insert(
                name.to_string(),
                GlobalCell {
                    value,
                    version: 0,
                    state: CellState::Constant,
                    dependents: Vec::new(),
                },
            );
            return Vec::new();
        };
        if cell.state == CellState::Constant && same_value(&cell.value, &value) {
            return Vec::new();
        }
        cell.value = value;
        cell.version += 1;
        cell.state = CellState::Mutable;
        cell.dependents.drain(..).filter_map(|w| w.upgrade()).collect()
    }

    /// Register `code` as folding `name` at `version`. Fails if the cell
    /// changed since the compiler's snapshot.
    pub fn add_dependency(&mut self, name: &str, version: u32, code: &Rc<OptimizedCode>) -> bool {
        match self.cells.get_mut(name) {
            Some(cell) if cell.version == version && cell.state == CellState::Constant => {
                cell.dependents.retain(|w| w.strong_count() > 0);
                cell.dependents.push(Rc::downgrade(code));
                true
            }
            _ => false,
        }
    }

    /// What the compiler may assume about each cell
    pub fn snapshot(&self) -> HashMap<String, GlobalSnapshot> {
        self.cells
            .iter()
            .map(|(name, cell)| {
                let constant = match cell.state {
                    CellState::Constant => ConstValue::from_value(&cell.value),
                    CellState::Mutable => None,
                };
                (
                    name.clone(),
                    GlobalSnapshot {
                        version: cell.version,
                        constant,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_defines_constant() {
        let mut globals = Globals::new();
        assert!(globals.set("N", Value::Number(1.0)).is_empty());
        assert!(globals.is_constant("N"));
        assert_eq!(globals.version("N"), Some(0));
        let snap = globals.snapshot();
        assert_eq!(snap["N"].constant, Some(ConstValue::Number(1.0)));
    }

    #[test]
    fn test_rewrite_same_value_stays_constant() {
        let mut globals = Globals::new();
        globals.set("N", Value::Number(1.0));
        globals.set("N", Value::Number(1.0));
        assert!(globals.is_constant("N"));
        globals.set("N", Value::Number(2.0));
        assert!(!globals.is_constant("N"));
        assert_eq!(globals.version("N"), Some(1));
        assert_eq!(globals.snapshot()["N"].constant, None);
    }

    #[test]
    fn test_minus_zero_is_a_change() {
        let mut globals = Globals::new();
        globals.set("Z", Value::Number(0.0));
        globals.set("Z", Value::Number(-0.0));
        assert!(!globals.is_constant("Z"));
    }

    #[test]
    fn test_stale_dependency_rejected() {
        let mut globals = Globals::new();
        globals.set("N", Value::Number(1.0));
        globals.set("N", Value::Number(3.0));
        let unit = crate::jit::ir::OptimizedUnit {
            function: crate::engine::FunctionId(0),
            name: "f".into(),
            bytecode_version: 0,
            code: Vec::new(),
            guards: Vec::new(),
            frame_states: Vec::new(),
            register_count: 0,
            param_count: 0,
            local_count: 0,
            global_dependencies: Vec::new(),
        };
        let code = Rc::new(OptimizedCode::new(unit, Default::default()));
        assert!(!globals.add_dependency("N", 0, &code));
        assert!(!globals.add_dependency("missing", 0, &code));
    }
}
