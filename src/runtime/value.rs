//! Runtime value representation
//!
//! Numbers are always IEEE doubles at this level. Whether a number is a small
//! integer ("Smi") is a classification, not a representation: the optimized
//! tier may hold it unboxed as an `i32`, but it converts back to the same
//! `Value::Number` whenever a value crosses tiers.

use super::shape::Shape;
use crate::engine::FunctionId;
use crate::interpreter::ExecutionContext;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A runtime value
#[derive(Clone)]
pub enum Value {
    /// undefined
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// Immutable string
    String(Rc<str>),
    /// Plain object with a shape
    Object(Rc<RefCell<JsObject>>),
    /// Array with holes
    Array(Rc<RefCell<JsArray>>),
    /// Suspended or running generator
    Generator(Rc<RefCell<GeneratorObject>>),
}

/// A plain object: a shape plus one slot per shape key
#[derive(Clone)]
pub struct JsObject {
    pub shape: Rc<Shape>,
    pub slots: Vec<Value>,
}

impl JsObject {
    pub fn new(shape: Rc<Shape>) -> Self {
        Self {
            shape,
            slots: Vec::new(),
        }
    }

    /// Read a property by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.shape.lookup(name).and_then(|i| self.slots.get(i))
    }
}

/// An array; `None` marks a hole
#[derive(Clone, Default)]
pub struct JsArray {
    pub elements: Vec<Option<Value>>,
}

impl JsArray {
    /// A holey array of the given length
    pub fn with_holes(len: usize) -> Self {
        Self {
            elements: vec![None; len],
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            elements: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Lifecycle of a generator object
pub enum GeneratorState {
    /// Created by a call; the body has not started
    NotStarted(Vec<Value>),
    /// Suspended at a `Yield`; resumption happens in the baseline tier
    Suspended(ExecutionContext),
    /// Currently executing
    Running,
    /// Returned or threw
    Completed,
}

/// A generator instance
pub struct GeneratorObject {
    pub function: FunctionId,
    pub state: GeneratorState,
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::String(Rc::from(s))
    }

    pub fn new_object(object: JsObject) -> Value {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn new_array(array: JsArray) -> Value {
        Value::Array(Rc::new(RefCell::new(array)))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Number payload, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Truthiness
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Object(_) | Value::Array(_) | Value::Generator(_) => true,
        }
    }

    /// Numeric conversion
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(true) => 1.0,
            Value::Boolean(false) => 0.0,
            Value::Number(n) => *n,
            Value::String(s) => string_to_number(s),
            Value::Object(_) | Value::Generator(_) => f64::NAN,
            Value::Array(arr) => {
                let arr = arr.borrow();
                match arr.elements.as_slice() {
                    [] => 0.0,
                    [Some(only)] => Value::string(&only.to_js_string()).to_number(),
                    _ => f64::NAN,
                }
            }
        }
    }

    /// String conversion (`ToString`)
    ///
    /// Arrays join their elements; an array reached again while it is being
    /// joined contributes the empty string.
    pub fn to_js_string(&self) -> String {
        let mut joining = Vec::new();
        js_string_inner(self, &mut joining)
    }

    /// `typeof`-style name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) | Value::Array(_) | Value::Generator(_) => "object",
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Generator(a), Value::Generator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Deep comparison: same layout, same property order, same leaves.
    ///
    /// Used to compare results of the two tiers, which allocate distinct
    /// objects for the same computation.
    pub fn structural_eq(&self, other: &Value) -> bool {
        let mut seen = Vec::new();
        structural_eq_inner(self, other, &mut seen)
    }
}

fn js_string_inner(value: &Value, joining: &mut Vec<usize>) -> String {
    match value {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.to_string(),
        Value::Object(_) => "[object Object]".to_string(),
        Value::Generator(_) => "[object Generator]".to_string(),
        Value::Array(arr) => {
            let ptr = Rc::as_ptr(arr) as usize;
            if joining.contains(&ptr) {
                return String::new();
            }
            joining.push(ptr);
            let joined = arr
                .borrow()
                .elements
                .iter()
                .map(|e| match e {
                    None | Some(Value::Undefined) | Some(Value::Null) => String::new(),
                    Some(v) => js_string_inner(v, joining),
                })
                .collect::<Vec<_>>()
                .join(",");
            joining.pop();
            joined
        }
    }
}

/// `ToNumber` on a string: decimal literals, `Infinity`, and `0x`/`0o`/`0b`
/// integers. Anything else is NaN.
fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let radix = match trimmed.get(..2) {
        Some("0x") | Some("0X") => Some(16),
        Some("0o") | Some("0O") => Some(8),
        Some("0b") | Some("0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let digits = &trimmed[2..];
        if digits.is_empty() {
            return f64::NAN;
        }
        return digits
            .chars()
            .try_fold(0.0f64, |acc, c| c.to_digit(radix).map(|d| acc * radix as f64 + d as f64))
            .unwrap_or(f64::NAN);
    }
    let unsigned = trimmed.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(trimmed);
    if unsigned == "Infinity" {
        return if trimmed.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    // `str::parse` also takes "inf", "nan" and friends
    if !unsigned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return f64::NAN;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}

fn structural_eq_inner(a: &Value, b: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            let key = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let (x, y) = (x.borrow(), y.borrow());
            x.shape.keys() == y.shape.keys()
                && x.slots.len() == y.slots.len()
                && x.slots
                    .iter()
                    .zip(y.slots.iter())
                    .all(|(p, q)| structural_eq_inner(p, q, seen))
        }
        (Value::Array(x), Value::Array(y)) => {
            let key = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let (x, y) = (x.borrow(), y.borrow());
            x.elements.len() == y.elements.len()
                && x.elements.iter().zip(y.elements.iter()).all(|(p, q)| match (p, q) {
                    (None, None) => true,
                    (Some(p), Some(q)) => structural_eq_inner(p, q, seen),
                    _ => false,
                })
        }
        _ => a == b,
    }
}

/// Number formatting following `Number.prototype.toString()` for the common cases
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl PartialEq for Value {
    /// Identity for heap values; NaN equals NaN so results compare in tests
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = Vec::new();
        write_value(f, self, &mut seen)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, seen: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Object(obj) => {
            let ptr = Rc::as_ptr(obj) as usize;
            if seen.contains(&ptr) {
                return write!(f, "[Circular]");
            }
            seen.push(ptr);
            let obj = obj.borrow();
            write!(f, "{{")?;
            for (i, (key, slot)) in obj.shape.keys().iter().zip(obj.slots.iter()).enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, " {}: ", key)?;
                write_value(f, slot, seen)?;
            }
            if obj.slots.is_empty() {
                write!(f, "}}")?;
            } else {
                write!(f, " }}")?;
            }
            seen.pop();
            Ok(())
        }
        Value::Array(arr) => {
            let ptr = Rc::as_ptr(arr) as usize;
            if seen.contains(&ptr) {
                return write!(f, "[Circular]");
            }
            seen.push(ptr);
            write!(f, "[")?;
            for (i, element) in arr.borrow().elements.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match element {
                    Some(v) => write_value(f, v, seen)?,
                    None => write!(f, "<hole>")?,
                }
            }
            seen.pop();
            write!(f, "]")
        }
        Value::String(s) => write!(f, "{}", s),
        other => write!(f, "{}", other.to_js_string()),
    }
}
