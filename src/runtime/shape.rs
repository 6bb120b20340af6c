//! Object shapes (hidden classes)
//!
//! A shape describes the ordered property layout of an object. Shapes form a
//! transition tree rooted at the empty shape: adding property `x` to an object
//! of shape `S` moves it to the child `S --x-->`, creating that child on first
//! use. Objects built by the same sequence of property additions therefore
//! share one [`ShapeId`], which is what feedback and shape guards key on.

use rustc_hash::FxHashMap as HashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Identity of a shape, stable for the lifetime of its [`ShapeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A property layout
pub struct Shape {
    id: ShapeId,
    keys: Vec<Rc<str>>,
    transitions: RefCell<HashMap<Rc<str>, Rc<Shape>>>,
}

impl Shape {
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// Property names in slot order
    pub fn keys(&self) -> &[Rc<str>] {
        &self.keys
    }

    /// Slot offset of a property
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.keys.iter().position(|k| &**k == name)
    }

    pub fn property_count(&self) -> usize {
        self.keys.len()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.id)?;
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, "}}")
    }
}

/// Owner of the transition tree
pub struct ShapeTable {
    root: Rc<Shape>,
    next_id: Cell<u32>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self {
            root: Rc::new(Shape {
                id: ShapeId(0),
                keys: Vec::new(),
                transitions: RefCell::new(HashMap::default()),
            }),
            next_id: Cell::new(1),
        }
    }

    /// The empty shape every fresh object starts with
    pub fn root(&self) -> Rc<Shape> {
        Rc::clone(&self.root)
    }

    /// Shape reached by appending `name` to `shape`
    pub fn transition(&self, shape: &Rc<Shape>, name: &str) -> Rc<Shape> {
        if let Some(child) = shape.transitions.borrow().get(name) {
            return Rc::clone(child);
        }
        let id = ShapeId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let mut keys = shape.keys.clone();
        let key: Rc<str> = Rc::from(name);
        keys.push(Rc::clone(&key));
        let child = Rc::new(Shape {
            id,
            keys,
            transitions: RefCell::new(HashMap::default()),
        });
        shape.transitions.borrow_mut().insert(key, Rc::clone(&child));
        child
    }

    /// Number of shapes created so far, root included
    pub fn len(&self) -> usize {
        self.next_id.get() as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_shape() {
        let table = ShapeTable::new();
        let a = table.transition(&table.root(), "x");
        let b = table.transition(&table.root(), "x");
        assert_eq!(a.id(), b.id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_order_matters() {
        let table = ShapeTable::new();
        let xy = table.transition(&table.transition(&table.root(), "x"), "y");
        let yx = table.transition(&table.transition(&table.root(), "y"), "x");
        assert_ne!(xy.id(), yx.id());
        assert_eq!(xy.lookup("y"), Some(1));
        assert_eq!(yx.lookup("y"), Some(0));
        assert_eq!(xy.lookup("z"), None);
    }
}
