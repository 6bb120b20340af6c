//! Escape analysis
//!
//! Finds `CreateObject` allocations whose object never leaves the function
//! frame. Such an object is only ever moved between locals and stack slots,
//! has properties defined, read or written, or is stored into another such
//! object. The lowering pass keeps its fields in registers instead of
//! allocating, and frame states describe it so the deoptimizer can build it
//! if a guard fails.
//!
//! The analysis is an abstract interpretation over the bytecode. Each local
//! and stack slot is either `Unknown` or `Alloc(site)`. Field contents are
//! summarized per (allocation, name) over the whole function, and the set
//! of defined fields is tracked per program point so that every path
//! reaching a point agrees on the object's layout. Any disagreement, and
//! any use not listed above, makes the allocation escape. Escaping is
//! transitive through fields. Rounds repeat until the escape set and the
//! field summary are both stable.

use crate::bytecode::analysis::{BytecodeAnalysis, LocalSet};
use crate::bytecode::{Chunk, Instruction};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeMap;

/// Index of the `CreateObject` instruction
pub type AllocId = usize;

const MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractValue {
    Unknown,
    Alloc(AllocId),
}

/// Abstract frame at one program point
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbstractState {
    pub locals: Vec<AbstractValue>,
    pub stack: Vec<AbstractValue>,
    /// Defined property names of reachable elided objects, in order
    pub layouts: BTreeMap<AllocId, Vec<String>>,
}

type FieldSummary = HashMap<(AllocId, String), AbstractValue>;

pub struct EscapeAnalysis {
    escaped: HashSet<AllocId>,
    fields: FieldSummary,
    entry: Vec<Option<AbstractState>>,
    exit: Vec<Option<AbstractState>>,
}

impl EscapeAnalysis {
    pub fn analyze(chunk: &Chunk, analysis: &BytecodeAnalysis, enabled: bool) -> Self {
        let allocations: Vec<AllocId> = analysis
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, (_, ins))| matches!(ins, Instruction::CreateObject))
            .map(|(i, _)| i)
            .collect();

        let mut escaped: HashSet<AllocId> = if enabled {
            HashSet::default()
        } else {
            allocations.iter().copied().collect()
        };
        let mut fields = FieldSummary::default();

        for _ in 0..MAX_ROUNDS {
            let Pass {
                fields_out,
                new_escapes: mut new,
                entry,
                exit,
                ..
            } = Pass::run(chunk, analysis, &escaped, &fields);
            close_over_fields(&mut new, &escaped, &fields_out);
            let stable = new.iter().all(|s| escaped.contains(s)) && fields_out == fields;
            if stable {
                return Self {
                    escaped,
                    fields,
                    entry,
                    exit,
                };
            }
            escaped.extend(new);
            fields = fields_out;
        }

        // did not settle: give up on elision for this function
        let escaped: HashSet<AllocId> = allocations.into_iter().collect();
        let fields = FieldSummary::default();
        let Pass { entry, exit, .. } = Pass::run(chunk, analysis, &escaped, &fields);
        Self {
            escaped,
            fields,
            entry,
            exit,
        }
    }

    pub fn is_virtual(&self, alloc: AllocId) -> bool {
        !self.escaped.contains(&alloc)
    }

    /// What a field of an elided object holds
    pub fn field(&self, alloc: AllocId, name: &str) -> AbstractValue {
        match self.fields.get(&(alloc, name.to_string())) {
            Some(AbstractValue::Alloc(t)) if self.is_virtual(*t) => AbstractValue::Alloc(*t),
            _ => AbstractValue::Unknown,
        }
    }

    /// All (allocation, field) pairs kept in registers, in a stable order
    pub fn virtual_fields(&self) -> Vec<(AllocId, String)> {
        let mut out: Vec<(AllocId, String)> = self
            .fields
            .keys()
            .filter(|(s, _)| self.is_virtual(*s))
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn elided_count(&self) -> usize {
        self.entry
            .iter()
            .flatten()
            .flat_map(|s| s.layouts.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Abstract state on entry to instruction `index`; `None` if unreachable
    pub fn entry(&self, index: usize) -> Option<&AbstractState> {
        self.entry.get(index).and_then(Option::as_ref)
    }

    /// Abstract state right after instruction `index` executes
    pub fn exit(&self, index: usize) -> Option<&AbstractState> {
        self.exit.get(index).and_then(Option::as_ref)
    }
}

/// Make everything stored in an escaping object escape too
fn close_over_fields(new: &mut HashSet<AllocId>, escaped: &HashSet<AllocId>, fields: &FieldSummary) {
    loop {
        let mut grew = false;
        for ((owner, _), value) in fields {
            if let AbstractValue::Alloc(t) = value {
                if (new.contains(owner) || escaped.contains(owner)) && !escaped.contains(t) && new.insert(*t) {
                    grew = true;
                }
            }
        }
        if !grew {
            return;
        }
    }
}

/// One round of the abstract interpretation
struct Pass<'a> {
    analysis: &'a BytecodeAnalysis,
    chunk: &'a Chunk,
    escaped: &'a HashSet<AllocId>,
    fields_in: &'a FieldSummary,
    fields_out: FieldSummary,
    new_escapes: HashSet<AllocId>,
    entry: Vec<Option<AbstractState>>,
    exit: Vec<Option<AbstractState>>,
}

impl<'a> Pass<'a> {
    fn run(chunk: &'a Chunk, analysis: &'a BytecodeAnalysis, escaped: &'a HashSet<AllocId>, fields_in: &'a FieldSummary) -> Self {
        let n = analysis.instructions.len();
        let mut pass = Self {
            analysis,
            chunk,
            escaped,
            fields_in,
            fields_out: FieldSummary::default(),
            new_escapes: HashSet::default(),
            entry: vec![None; n],
            exit: vec![None; n],
        };
        if n == 0 {
            return pass;
        }
        pass.entry[0] = Some(AbstractState {
            locals: vec![AbstractValue::Unknown; chunk.local_count as usize],
            ..AbstractState::default()
        });
        let mut worklist = vec![0usize];
        while let Some(i) = worklist.pop() {
            let Some(state) = pass.entry[i].clone() else {
                continue;
            };
            let out = pass.transfer(i, state);
            let (_, instruction) = analysis.instructions[i];
            let mut successors = Vec::with_capacity(2);
            if !instruction.is_terminator() && i + 1 < n {
                successors.push(i + 1);
            }
            if let Some(target) = instruction.jump_target().and_then(|t| analysis.index_of(t)) {
                successors.push(target);
            }
            for successor in successors {
                if pass.merge_into(successor, &out) {
                    worklist.push(successor);
                }
            }
            pass.exit[i] = Some(out);
        }
        pass
    }

    fn escape(&mut self, value: AbstractValue) {
        if let AbstractValue::Alloc(s) = value {
            self.new_escapes.insert(s);
        }
    }

    /// Allocations reachable from the frame, fields included
    fn referenced(&self, state: &AbstractState) -> HashSet<AllocId> {
        let mut seen = HashSet::default();
        let mut work: Vec<AllocId> = state
            .locals
            .iter()
            .chain(state.stack.iter())
            .filter_map(|v| match v {
                AbstractValue::Alloc(s) => Some(*s),
                AbstractValue::Unknown => None,
            })
            .collect();
        while let Some(s) = work.pop() {
            if !seen.insert(s) {
                continue;
            }
            if let Some(names) = state.layouts.get(&s) {
                for name in names {
                    if let Some(AbstractValue::Alloc(t)) = self.fields_in.get(&(s, name.clone())) {
                        work.push(*t);
                    }
                }
            }
        }
        seen
    }

    fn prune(&self, state: &mut AbstractState) {
        let live = self.referenced(state);
        state.layouts.retain(|s, _| live.contains(s));
    }

    fn kill_dead_locals(state: &mut AbstractState, live: &LocalSet) {
        for (l, value) in state.locals.iter_mut().enumerate() {
            if !live.contains(l as u8) {
                *value = AbstractValue::Unknown;
            }
        }
    }

    /// Join `incoming` into the entry state of `target`; returns whether it changed
    fn merge_into(&mut self, target: usize, incoming: &AbstractState) -> bool {
        let mut incoming = incoming.clone();
        Self::kill_dead_locals(&mut incoming, self.analysis.live_at(target));
        self.prune(&mut incoming);

        let Some(existing) = self.entry[target].clone() else {
            self.entry[target] = Some(incoming);
            return true;
        };
        if existing == incoming {
            return false;
        }

        let mut joined = existing.clone();
        let slots = joined.locals.iter_mut().zip(incoming.locals.iter());
        let stack = joined.stack.iter_mut().zip(incoming.stack.iter());
        let mut conflicts = Vec::new();
        for (a, b) in slots.chain(stack) {
            if *a != *b {
                conflicts.push(*a);
                conflicts.push(*b);
                *a = AbstractValue::Unknown;
            }
        }
        for value in conflicts {
            self.escape(value);
        }
        let reachable = self.referenced(&joined);
        for s in reachable {
            if existing.layouts.get(&s) != incoming.layouts.get(&s) {
                self.new_escapes.insert(s);
            }
        }
        self.prune(&mut joined);

        if joined != existing {
            self.entry[target] = Some(joined);
            true
        } else {
            false
        }
    }

    fn store_field(&mut self, state: &mut AbstractState, alloc: AllocId, name: &str, value: AbstractValue) {
        let key = (alloc, name.to_string());
        match self.fields_out.get(&key).copied() {
            None => {
                self.fields_out.insert(key, value);
            }
            Some(old) if old != value => {
                self.escape(old);
                self.escape(value);
                self.fields_out.insert(key, AbstractValue::Unknown);
            }
            Some(_) => {}
        }
        let layout = state.layouts.entry(alloc).or_default();
        if !layout.iter().any(|n| n == name) {
            layout.push(name.to_string());
        }
    }

    fn load_field(&self, state: &AbstractState, alloc: AllocId, name: &str) -> AbstractValue {
        let defined = state
            .layouts
            .get(&alloc)
            .is_some_and(|names| names.iter().any(|n| n == name));
        if !defined {
            return AbstractValue::Unknown;
        }
        match self.fields_in.get(&(alloc, name.to_string())) {
            Some(AbstractValue::Alloc(t)) if !self.escaped.contains(t) => AbstractValue::Alloc(*t),
            _ => AbstractValue::Unknown,
        }
    }

    fn pop(state: &mut AbstractState) -> AbstractValue {
        state.stack.pop().unwrap_or(AbstractValue::Unknown)
    }

    fn pop_escaping(&mut self, state: &mut AbstractState, count: usize) {
        for _ in 0..count {
            let value = Self::pop(state);
            self.escape(value);
        }
    }

    fn transfer(&mut self, index: usize, mut state: AbstractState) -> AbstractState {
        let (offset, instruction) = self.analysis.instructions[index];
        match instruction {
            Instruction::Nop | Instruction::Jump(_) | Instruction::ReturnUndefined => {}
            Instruction::Pop => {
                Self::pop(&mut state);
            }
            Instruction::Dup => {
                let top = state.stack.last().copied().unwrap_or(AbstractValue::Unknown);
                state.stack.push(top);
            }
            Instruction::Swap => {
                let b = Self::pop(&mut state);
                let a = Self::pop(&mut state);
                state.stack.push(b);
                state.stack.push(a);
            }
            Instruction::LoadConst(_)
            | Instruction::LoadUndefined
            | Instruction::LoadNull
            | Instruction::LoadTrue
            | Instruction::LoadFalse
            | Instruction::GetGlobal(_)
            | Instruction::NewArray(_) => state.stack.push(AbstractValue::Unknown),
            Instruction::CreateObject => {
                let value = if self.escaped.contains(&index) {
                    AbstractValue::Unknown
                } else if self.referenced(&state).contains(&index) {
                    // a previous instance is still reachable
                    self.new_escapes.insert(index);
                    AbstractValue::Unknown
                } else {
                    state.layouts.insert(index, Vec::new());
                    AbstractValue::Alloc(index)
                };
                state.stack.push(value);
            }
            Instruction::GetLocal(l) => {
                let value = state.locals.get(l as usize).copied().unwrap_or(AbstractValue::Unknown);
                state.stack.push(value);
            }
            Instruction::SetLocal(l) => {
                let value = Self::pop(&mut state);
                if let Some(slot) = state.locals.get_mut(l as usize) {
                    *slot = value;
                }
            }
            Instruction::GetNamed { name, .. } => {
                let object = Self::pop(&mut state);
                let value = match (object, self.chunk.name_at(name, offset)) {
                    (AbstractValue::Alloc(s), Ok(name)) => self.load_field(&state, s, name),
                    _ => AbstractValue::Unknown,
                };
                state.stack.push(value);
            }
            Instruction::SetNamed { name, .. } | Instruction::DefineNamed(name) => {
                let value = Self::pop(&mut state);
                let object = Self::pop(&mut state);
                match (object, self.chunk.name_at(name, offset)) {
                    (AbstractValue::Alloc(s), Ok(name)) => {
                        let name = name.to_string();
                        self.store_field(&mut state, s, &name, value);
                    }
                    _ => self.escape(value),
                }
                if matches!(instruction, Instruction::DefineNamed(_)) {
                    state.stack.push(object);
                }
            }
            Instruction::LoadElement(_)
            | Instruction::Add(_)
            | Instruction::Arith(..)
            | Instruction::Compare(..)
            | Instruction::StrictEq
            | Instruction::StrictNe => {
                self.pop_escaping(&mut state, 2);
                state.stack.push(AbstractValue::Unknown);
            }
            Instruction::StoreElement(_) => self.pop_escaping(&mut state, 3),
            Instruction::Neg | Instruction::Not => {
                self.pop_escaping(&mut state, 1);
                state.stack.push(AbstractValue::Unknown);
            }
            Instruction::SetGlobal(_)
            | Instruction::JumpIfFalse(_)
            | Instruction::JumpIfTrue(_)
            | Instruction::Return
            | Instruction::Throw
            | Instruction::Emit => self.pop_escaping(&mut state, 1),
            Instruction::Call { argc, .. } => {
                self.pop_escaping(&mut state, argc as usize);
                state.stack.push(AbstractValue::Unknown);
            }
            Instruction::Yield => {
                self.pop_escaping(&mut state, 1);
                state.stack.push(AbstractValue::Unknown);
            }
        }
        state
    }
}
