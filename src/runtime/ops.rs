//! Operator semantics shared by both tiers
//!
//! The baseline interpreter calls these for every operation; the optimized
//! tier calls them on every generic (unspeculated) path. Keeping one
//! definition is what makes results identical across tiers.

use super::shape::ShapeTable;
use super::value::{JsObject, Value};
use crate::error::{Error, Result};
use std::rc::Rc;

/// Largest index an array store may create
const MAX_ARRAY_INDEX: usize = 1 << 24;

/// Arithmetic operators other than `+`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Sub,
    Mul,
    Div,
    Mod,
}

/// Relational operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn apply_f64(self, a: f64, b: f64) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        }
    }

    pub fn apply_i32(self, a: i32, b: i32) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        }
    }

    fn apply_str(self, a: &str, b: &str) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        }
    }
}

fn is_string_like(v: &Value) -> bool {
    matches!(
        v,
        Value::String(_) | Value::Object(_) | Value::Array(_) | Value::Generator(_)
    )
}

/// `a + b`
pub fn add(a: &Value, b: &Value) -> Value {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Value::Number(x + y);
    }
    if is_string_like(a) || is_string_like(b) {
        let mut s = a.to_js_string();
        s.push_str(&b.to_js_string());
        return Value::String(Rc::from(s));
    }
    Value::Number(a.to_number() + b.to_number())
}

/// `a - b`, `a * b`, `a / b`, `a % b`
pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Value {
    Value::Number(arith_f64(op, a.to_number(), b.to_number()))
}

pub fn arith_f64(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => x % y,
    }
}

/// `-a`
pub fn neg(a: &Value) -> Value {
    Value::Number(-a.to_number())
}

/// `!a`
pub fn not(a: &Value) -> Value {
    Value::Boolean(!a.to_boolean())
}

/// `a < b` and friends
pub fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return op.apply_str(x, y);
    }
    op.apply_f64(a.to_number(), b.to_number())
}

/// `receiver.name`
pub fn get_named(receiver: &Value, name: &str) -> Result<Value> {
    match receiver {
        Value::Undefined | Value::Null => Err(Error::type_error(format!(
            "Cannot read properties of {} (reading '{}')",
            receiver.type_name_for_error(),
            name
        ))),
        Value::Object(obj) => Ok(obj.borrow().get(name).cloned().unwrap_or(Value::Undefined)),
        Value::Array(arr) if name == "length" => Ok(Value::Number(arr.borrow().len() as f64)),
        Value::String(s) if name == "length" => Ok(Value::Number(s.encode_utf16().count() as f64)),
        _ => Ok(Value::Undefined),
    }
}

/// `receiver.name = value`; adding a property transitions the shape
pub fn set_named(shapes: &ShapeTable, receiver: &Value, name: &str, value: Value) -> Result<()> {
    match receiver {
        Value::Undefined | Value::Null => Err(Error::type_error(format!(
            "Cannot set properties of {} (setting '{}')",
            receiver.type_name_for_error(),
            name
        ))),
        Value::Object(obj) => {
            let mut obj = obj.borrow_mut();
            define_property(shapes, &mut obj, name, value);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Store or append a property on an object
pub fn define_property(shapes: &ShapeTable, obj: &mut JsObject, name: &str, value: Value) {
    match obj.shape.lookup(name) {
        Some(offset) => obj.slots[offset] = value,
        None => {
            obj.shape = shapes.transition(&obj.shape, name);
            obj.slots.push(value);
        }
    }
}

/// Convert a value to an array index, if it is one
pub fn array_index(index: &Value) -> Option<usize> {
    match index {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < u32::MAX as f64 => {
            Some(*n as usize)
        }
        _ => None,
    }
}

/// Result of an element load
pub struct ElementLoad {
    pub value: Value,
    /// The read hit a hole or went out of bounds
    pub hole_or_oob: bool,
}

/// `receiver[index]`
pub fn load_element(receiver: &Value, index: &Value) -> Result<ElementLoad> {
    match receiver {
        Value::Undefined | Value::Null => Err(Error::type_error(format!(
            "Cannot read properties of {} (reading '{}')",
            receiver.type_name_for_error(),
            index.to_js_string()
        ))),
        Value::Array(arr) => {
            let arr = arr.borrow();
            let slot = array_index(index).and_then(|i| arr.elements.get(i));
            Ok(match slot {
                Some(Some(v)) => ElementLoad {
                    value: v.clone(),
                    hole_or_oob: false,
                },
                _ => ElementLoad {
                    value: Value::Undefined,
                    hole_or_oob: true,
                },
            })
        }
        // indexes count UTF-16 code units; half of a surrogate pair reads as U+FFFD
        Value::String(s) => {
            let unit = array_index(index).and_then(|i| s.encode_utf16().nth(i));
            Ok(match unit {
                Some(u) => ElementLoad {
                    value: Value::String(Rc::from(String::from_utf16_lossy(&[u]))),
                    hole_or_oob: false,
                },
                None => ElementLoad {
                    value: Value::Undefined,
                    hole_or_oob: true,
                },
            })
        }
        Value::Object(_) => Ok(ElementLoad {
            value: get_named(receiver, &index.to_js_string())?,
            hole_or_oob: false,
        }),
        _ => Ok(ElementLoad {
            value: Value::Undefined,
            hole_or_oob: false,
        }),
    }
}

/// `receiver[index] = value`; returns whether the store grew the array or filled a hole
pub fn store_element(shapes: &ShapeTable, receiver: &Value, index: &Value, value: Value) -> Result<bool> {
    match receiver {
        Value::Undefined | Value::Null => Err(Error::type_error(format!(
            "Cannot set properties of {} (setting '{}')",
            receiver.type_name_for_error(),
            index.to_js_string()
        ))),
        Value::Array(arr) => {
            let i = array_index(index)
                .filter(|i| *i < MAX_ARRAY_INDEX)
                .ok_or_else(|| Error::range_error(format!("Invalid array index {}", index.to_js_string())))?;
            let mut arr = arr.borrow_mut();
            let mut grew = false;
            if i >= arr.elements.len() {
                arr.elements.resize(i + 1, None);
                grew = true;
            }
            let filled_hole = arr.elements[i].is_none();
            arr.elements[i] = Some(value);
            Ok(grew || filled_hole)
        }
        Value::Object(_) => {
            set_named(shapes, receiver, &index.to_js_string(), value)?;
            Ok(false)
        }
        _ => Ok(false),
    }
}

impl Value {
    fn type_name_for_error(&self) -> &'static str {
        match self {
            Value::Null => "null",
            _ => "undefined",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::JsArray;

    #[test]
    fn test_add_semantics() {
        assert_eq!(add(&Value::Number(1.0), &Value::Number(2.0)), Value::Number(3.0));
        assert_eq!(add(&Value::string("a"), &Value::Number(1.0)), Value::string("a1"));
        assert_eq!(add(&Value::Boolean(true), &Value::Null), Value::Number(1.0));
        assert_eq!(
            add(&Value::Number(2147483648.0), &Value::Number(2147483648.0)),
            Value::Number(4294967296.0)
        );
    }

    #[test]
    fn test_compare() {
        assert!(compare(CompareOp::Lt, &Value::Number(1.0), &Value::Number(2.0)));
        assert!(compare(CompareOp::Lt, &Value::string("a"), &Value::string("b")));
        assert!(!compare(CompareOp::Ge, &Value::Number(f64::NAN), &Value::Number(0.0)));
    }

    #[test]
    fn test_named_access_errors() {
        let err = get_named(&Value::Undefined, "x").unwrap_err();
        assert_eq!(err.to_string(), "TypeError: Cannot read properties of undefined (reading 'x')");
        let shapes = ShapeTable::new();
        let err = set_named(&shapes, &Value::Null, "x", Value::Null).unwrap_err();
        assert!(err.to_string().contains("Cannot set properties of null"));
    }

    #[test]
    fn test_set_named_transitions() {
        let shapes = ShapeTable::new();
        let obj = Value::new_object(JsObject::new(shapes.root()));
        set_named(&shapes, &obj, "x", Value::Number(1.0)).unwrap();
        set_named(&shapes, &obj, "x", Value::Number(2.0)).unwrap();
        assert_eq!(get_named(&obj, "x").unwrap(), Value::Number(2.0));
        assert_eq!(shapes.len(), 2);
    }

    #[test]
    fn test_elements() {
        let shapes = ShapeTable::new();
        let arr = Value::new_array(JsArray::with_holes(2));
        let load = load_element(&arr, &Value::Number(0.0)).unwrap();
        assert!(load.hole_or_oob);
        assert!(load.value.is_undefined());

        assert!(store_element(&shapes, &arr, &Value::Number(3.0), Value::Number(9.0)).unwrap());
        assert_eq!(get_named(&arr, "length").unwrap(), Value::Number(4.0));
        let load = load_element(&arr, &Value::Number(3.0)).unwrap();
        assert!(!load.hole_or_oob);
        assert_eq!(load.value, Value::Number(9.0));
    }

    #[test]
    fn test_string_indexing_counts_utf16_units() {
        let s = Value::string("aé😀");
        assert_eq!(get_named(&s, "length").unwrap(), Value::Number(4.0));
        assert_eq!(load_element(&s, &Value::Number(1.0)).unwrap().value, Value::string("é"));
        assert_eq!(load_element(&s, &Value::Number(2.0)).unwrap().value, Value::string("\u{FFFD}"));
        let past = load_element(&s, &Value::Number(4.0)).unwrap();
        assert!(past.hole_or_oob);
        assert!(past.value.is_undefined());
    }
}
