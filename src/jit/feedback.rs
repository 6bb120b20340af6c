//! Type feedback
//!
//! Every site-bearing instruction owns one [`FeedbackSlot`] in its function's
//! [`FeedbackVector`]. The baseline interpreter records what it observes; the
//! speculative compiler reads a snapshot and specializes on it. A slot only
//! ever widens: Uninitialized, Monomorphic, Polymorphic, Megamorphic.
//! Clearing is an explicit operation.

use crate::bytecode::{CallSite, SiteKind};
use crate::runtime::{ShapeId, Value};
use std::fmt;
use tracing::trace;

/// Classification of a runtime value, as seen by feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Undefined,
    Null,
    Boolean,
    /// Integral number in `i32` range that is not `-0`
    Smi,
    /// Any other number
    HeapNumber,
    String,
    Object(ShapeId),
    Array,
    Generator,
}

/// Whether a double is representable as a small integer
pub fn is_smi(n: f64) -> bool {
    n.fract() == 0.0
        && n >= i32::MIN as f64
        && n <= i32::MAX as f64
        && !(n == 0.0 && n.is_sign_negative())
}

/// Classify a value. Total, and identical for both tiers since optimized
/// registers are converted back to [`Value`]s before anything is classified.
pub fn classify(value: &Value) -> Kind {
    Kind::of(value)
}

impl Kind {
    /// Classify a value
    pub fn of(value: &Value) -> Kind {
        match value {
            Value::Undefined => Kind::Undefined,
            Value::Null => Kind::Null,
            Value::Boolean(_) => Kind::Boolean,
            Value::Number(n) if is_smi(*n) => Kind::Smi,
            Value::Number(_) => Kind::HeapNumber,
            Value::String(_) => Kind::String,
            Value::Object(obj) => Kind::Object(obj.borrow().shape.id()),
            Value::Array(_) => Kind::Array,
            Value::Generator(_) => Kind::Generator,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Kind::Smi | Kind::HeapNumber)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Object(shape) => write!(f, "Object({})", shape),
            other => write!(f, "{:?}", other),
        }
    }
}

/// How many distinct kinds a slot has seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cardinality {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a named access resolved for one receiver shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyHandler {
    /// In-object field at the given slot offset
    Field(usize),
    /// The shape has no such property
    Missing,
}

/// Feedback for one site
#[derive(Debug, Clone)]
pub struct FeedbackSlot {
    pub site_kind: SiteKind,
    cardinality: Cardinality,
    /// Distinct kinds in first-seen order; emptied on going megamorphic
    kinds: Vec<Kind>,
    /// Per-receiver-shape handlers of named sites
    handlers: Vec<(ShapeId, PropertyHandler)>,
    /// Element sites: some access read a hole or went out of bounds
    pub saw_hole_or_oob: bool,
    /// Element sites: some index was not a Smi
    pub saw_non_smi_index: bool,
    pub sample_count: u64,
}

impl FeedbackSlot {
    pub fn new(site_kind: SiteKind) -> Self {
        Self {
            site_kind,
            cardinality: Cardinality::Uninitialized,
            kinds: Vec::new(),
            handlers: Vec::new(),
            saw_hole_or_oob: false,
            saw_non_smi_index: false,
            sample_count: 0,
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    pub fn handlers(&self) -> &[(ShapeId, PropertyHandler)] {
        &self.handlers
    }

    pub fn is_megamorphic(&self) -> bool {
        self.cardinality == Cardinality::Megamorphic
    }

    /// All observed kinds satisfy `pred`; false for uninitialized or megamorphic slots
    pub fn all_kinds(&self, pred: impl Fn(&Kind) -> bool) -> bool {
        !self.kinds.is_empty() && self.kinds.iter().all(pred)
    }

    pub fn contains(&self, kind: Kind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Add a kind; returns true when this observation made the slot megamorphic
    fn add_kind(&mut self, kind: Kind, max_polymorphism: usize) -> bool {
        if self.cardinality == Cardinality::Megamorphic || self.kinds.contains(&kind) {
            return false;
        }
        if self.kinds.len() >= max_polymorphism {
            self.kinds.clear();
            self.handlers.clear();
            self.cardinality = Cardinality::Megamorphic;
            trace!(?kind, "feedback went megamorphic");
            return true;
        }
        self.kinds.push(kind);
        self.cardinality = if self.kinds.len() == 1 {
            Cardinality::Monomorphic
        } else {
            Cardinality::Polymorphic
        };
        trace!(?kind, cardinality = ?self.cardinality, "feedback widened");
        false
    }

    fn add_handler(&mut self, shape: ShapeId, handler: PropertyHandler) {
        if self.cardinality == Cardinality::Megamorphic {
            return;
        }
        if !self.handlers.iter().any(|(s, _)| *s == shape) {
            self.handlers.push((shape, handler));
        }
    }
}

/// Per-function feedback, one slot per call site
#[derive(Debug, Clone)]
pub struct FeedbackVector {
    slots: Vec<FeedbackSlot>,
    max_polymorphism: usize,
    megamorphic_sites: usize,
    /// Most kinds held by any non-megamorphic slot
    widest: usize,
}

impl FeedbackVector {
    pub fn new(call_sites: &[CallSite], max_polymorphism: usize) -> Self {
        Self {
            slots: call_sites.iter().map(|s| FeedbackSlot::new(s.kind)).collect(),
            max_polymorphism: max_polymorphism.max(1),
            megamorphic_sites: 0,
            widest: 0,
        }
    }

    pub fn slot(&self, site: u16) -> Option<&FeedbackSlot> {
        self.slots.get(site as usize)
    }

    pub fn slots(&self) -> &[FeedbackSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of megamorphic slots, kept current on every transition
    pub fn megamorphic_sites(&self) -> usize {
        self.megamorphic_sites
    }

    /// Largest number of distinct kinds at any non-megamorphic site
    pub fn widest_polymorphism(&self) -> usize {
        self.widest
    }

    /// First megamorphic site, if any
    pub fn first_megamorphic_site(&self) -> Option<u16> {
        if self.megamorphic_sites == 0 {
            return None;
        }
        self.slots.iter().position(|s| s.is_megamorphic()).map(|i| i as u16)
    }

    /// Record one observed kind at a site
    pub fn record_feedback(&mut self, site: u16, kind: Kind) {
        let max = self.max_polymorphism;
        if let Some(slot) = self.slots.get_mut(site as usize) {
            slot.sample_count += 1;
            if slot.add_kind(kind, max) {
                // the slot dropped its kinds; happens at most once per slot
                self.megamorphic_sites += 1;
                self.widest = self.slots.iter().map(|s| s.kinds.len()).max().unwrap_or(0);
            } else {
                self.widest = self.widest.max(slot.kinds.len());
            }
        }
    }

    /// Arithmetic and comparison sites: both operands plus the result
    pub fn record_binary(&mut self, site: u16, lhs: &Value, rhs: &Value, result: Option<&Value>) {
        self.record_feedback(site, Kind::of(lhs));
        self.record_feedback(site, Kind::of(rhs));
        if let Some(result) = result {
            self.record_feedback(site, Kind::of(result));
        }
    }

    /// Named load or store on `receiver`
    pub fn record_named(&mut self, site: u16, receiver: &Value, name: &str) {
        let kind = Kind::of(receiver);
        self.record_feedback(site, kind);
        let handler = match receiver {
            Value::Object(obj) => {
                let obj = obj.borrow();
                Some((
                    obj.shape.id(),
                    obj.shape
                        .lookup(name)
                        .map(PropertyHandler::Field)
                        .unwrap_or(PropertyHandler::Missing),
                ))
            }
            _ => None,
        };
        if let (Some((shape, handler)), Some(slot)) = (handler, self.slots.get_mut(site as usize)) {
            slot.add_handler(shape, handler);
        }
    }

    /// Element load or store
    pub fn record_element(&mut self, site: u16, receiver: &Value, index: &Value, hole_or_oob: bool) {
        self.record_feedback(site, Kind::of(receiver));
        if let Some(slot) = self.slots.get_mut(site as usize) {
            slot.saw_hole_or_oob |= hole_or_oob;
            slot.saw_non_smi_index |= Kind::of(index) != Kind::Smi;
        }
    }

    /// Reset every slot to Uninitialized
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = FeedbackSlot::new(slot.site_kind);
        }
        self.megamorphic_sites = 0;
        self.widest = 0;
    }

    /// An owned copy for the compiler; contains no shared runtime state
    pub fn snapshot(&self) -> FeedbackVector {
        self.clone()
    }
}
