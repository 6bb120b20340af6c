//! Programmatic chunk construction
//!
//! The engine does not parse source text. Hosts, tests and the CLI scenarios
//! assemble chunks with [`ChunkBuilder`], which takes care of operand
//! encoding, jump patching, constant deduplication and call-site allocation.

use super::opcode::Opcode;
use super::{CallSite, Chunk, ChunkFlags, Constant, SiteKind};
use crate::error::{Error, Result};
use crate::runtime::ops::{ArithOp, CompareOp};
use rustc_hash::FxHashMap as HashMap;

/// A jump target that may be bound before or after the jumps referring to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental chunk builder
pub struct ChunkBuilder {
    chunk: Chunk,
    labels: Vec<Option<usize>>,
    /// (offset of jump instruction, label)
    patches: Vec<(usize, Label)>,
    strings: HashMap<String, u16>,
    numbers: HashMap<u64, u16>,
}

impl ChunkBuilder {
    /// Start a function with `param_count` parameters
    pub fn new(name: impl Into<String>, param_count: u8) -> Self {
        let mut chunk = Chunk::new(name);
        chunk.param_count = param_count;
        chunk.local_count = param_count;
        Self {
            chunk,
            labels: Vec::new(),
            patches: Vec::new(),
            strings: HashMap::default(),
            numbers: HashMap::default(),
        }
    }

    /// Allocate a fresh local slot
    pub fn local(&mut self) -> u8 {
        let index = self.chunk.local_count;
        self.chunk.local_count = self.chunk.local_count.saturating_add(1);
        index
    }

    pub fn set_flags(&mut self, flags: ChunkFlags) -> &mut Self {
        self.chunk.flags |= flags;
        self
    }

    /// Mark the chunk as a generator body
    pub fn generator(&mut self) -> &mut Self {
        self.set_flags(ChunkFlags::GENERATOR)
    }

    /// Current bytecode offset
    pub fn offset(&self) -> usize {
        self.chunk.code.len()
    }

    // ========== Labels ==========

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current offset
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.offset());
        self
    }

    /// A label bound to the current offset, for backward jumps
    pub fn here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    // ========== Encoding ==========

    fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.chunk.code.push(opcode as u8);
        self
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.chunk.code.push(value);
        self
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.chunk.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn site(&mut self, kind: SiteKind, offset: usize) -> u16 {
        self.chunk.call_sites.push(CallSite { kind, offset });
        (self.chunk.call_sites.len() - 1) as u16
    }

    fn with_site(&mut self, opcode: Opcode, kind: SiteKind) -> &mut Self {
        let offset = self.offset();
        let site = self.site(kind, offset);
        self.op(opcode).u16(site)
    }

    fn jump_op(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        let offset = self.offset();
        self.patches.push((offset, label));
        self.op(opcode).u16(0)
    }

    fn string_constant(&mut self, s: &str) -> u16 {
        if let Some(&index) = self.strings.get(s) {
            return index;
        }
        let index = self.chunk.constants.len() as u16;
        self.chunk.constants.push(Constant::String(s.to_string()));
        self.strings.insert(s.to_string(), index);
        index
    }

    fn number_constant(&mut self, n: f64) -> u16 {
        if let Some(&index) = self.numbers.get(&n.to_bits()) {
            return index;
        }
        let index = self.chunk.constants.len() as u16;
        self.chunk.constants.push(Constant::Number(n));
        self.numbers.insert(n.to_bits(), index);
        index
    }

    // ========== Stack ==========

    pub fn nop(&mut self) -> &mut Self {
        self.op(Opcode::Nop)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.op(Opcode::Dup)
    }

    pub fn swap(&mut self) -> &mut Self {
        self.op(Opcode::Swap)
    }

    // ========== Constants ==========

    pub fn number(&mut self, n: f64) -> &mut Self {
        let index = self.number_constant(n);
        self.op(Opcode::LoadConst).u16(index)
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let index = self.string_constant(s);
        self.op(Opcode::LoadConst).u16(index)
    }

    pub fn undefined(&mut self) -> &mut Self {
        self.op(Opcode::LoadUndefined)
    }

    pub fn null(&mut self) -> &mut Self {
        self.op(Opcode::LoadNull)
    }

    pub fn boolean(&mut self, b: bool) -> &mut Self {
        self.op(if b { Opcode::LoadTrue } else { Opcode::LoadFalse })
    }

    // ========== Variables ==========

    pub fn get_local(&mut self, index: u8) -> &mut Self {
        self.op(Opcode::GetLocal).u8(index)
    }

    pub fn set_local(&mut self, index: u8) -> &mut Self {
        self.op(Opcode::SetLocal).u8(index)
    }

    pub fn get_global(&mut self, name: &str) -> &mut Self {
        let index = self.string_constant(name);
        self.op(Opcode::GetGlobal).u16(index)
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        let index = self.string_constant(name);
        self.op(Opcode::SetGlobal).u16(index)
    }

    // ========== Properties ==========

    pub fn get_named(&mut self, name: &str) -> &mut Self {
        let index = self.string_constant(name);
        let offset = self.offset();
        let site = self.site(SiteKind::NamedLoad, offset);
        self.op(Opcode::GetNamed).u16(index).u16(site)
    }

    pub fn set_named(&mut self, name: &str) -> &mut Self {
        let index = self.string_constant(name);
        let offset = self.offset();
        let site = self.site(SiteKind::NamedStore, offset);
        self.op(Opcode::SetNamed).u16(index).u16(site)
    }

    pub fn define_named(&mut self, name: &str) -> &mut Self {
        let index = self.string_constant(name);
        self.op(Opcode::DefineNamed).u16(index)
    }

    pub fn load_element(&mut self) -> &mut Self {
        self.with_site(Opcode::LoadElement, SiteKind::ElementLoad)
    }

    pub fn store_element(&mut self) -> &mut Self {
        self.with_site(Opcode::StoreElement, SiteKind::ElementStore)
    }

    pub fn create_object(&mut self) -> &mut Self {
        self.op(Opcode::CreateObject)
    }

    pub fn new_array(&mut self, len: u8) -> &mut Self {
        self.op(Opcode::NewArray).u8(len)
    }

    // ========== Operators ==========

    pub fn add(&mut self) -> &mut Self {
        self.with_site(Opcode::Add, SiteKind::BinaryOp)
    }

    pub fn arith(&mut self, op: ArithOp) -> &mut Self {
        let opcode = match op {
            ArithOp::Sub => Opcode::Sub,
            ArithOp::Mul => Opcode::Mul,
            ArithOp::Div => Opcode::Div,
            ArithOp::Mod => Opcode::Mod,
        };
        self.with_site(opcode, SiteKind::BinaryOp)
    }

    pub fn sub(&mut self) -> &mut Self {
        self.arith(ArithOp::Sub)
    }

    pub fn mul(&mut self) -> &mut Self {
        self.arith(ArithOp::Mul)
    }

    pub fn div(&mut self) -> &mut Self {
        self.arith(ArithOp::Div)
    }

    pub fn modulo(&mut self) -> &mut Self {
        self.arith(ArithOp::Mod)
    }

    pub fn neg(&mut self) -> &mut Self {
        self.op(Opcode::Neg)
    }

    pub fn compare(&mut self, op: CompareOp) -> &mut Self {
        let opcode = match op {
            CompareOp::Lt => Opcode::Lt,
            CompareOp::Le => Opcode::Le,
            CompareOp::Gt => Opcode::Gt,
            CompareOp::Ge => Opcode::Ge,
        };
        self.with_site(opcode, SiteKind::Compare)
    }

    pub fn lt(&mut self) -> &mut Self {
        self.compare(CompareOp::Lt)
    }

    pub fn strict_eq(&mut self) -> &mut Self {
        self.op(Opcode::StrictEq)
    }

    pub fn strict_ne(&mut self) -> &mut Self {
        self.op(Opcode::StrictNe)
    }

    pub fn not(&mut self) -> &mut Self {
        self.op(Opcode::Not)
    }

    // ========== Control Flow ==========

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.jump_op(Opcode::Jump, label)
    }

    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.jump_op(Opcode::JumpIfFalse, label)
    }

    pub fn jump_if_true(&mut self, label: Label) -> &mut Self {
        self.jump_op(Opcode::JumpIfTrue, label)
    }

    /// Call function `function` (a [`FunctionId`](crate::engine::FunctionId) index) with `argc` stack arguments
    pub fn call(&mut self, function: u16, argc: u8) -> &mut Self {
        self.op(Opcode::Call).u16(function).u8(argc)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    pub fn ret_undefined(&mut self) -> &mut Self {
        self.op(Opcode::ReturnUndefined)
    }

    pub fn throw(&mut self) -> &mut Self {
        self.op(Opcode::Throw)
    }

    pub fn emit(&mut self) -> &mut Self {
        self.op(Opcode::Emit)
    }

    pub fn yield_value(&mut self) -> &mut Self {
        self.op(Opcode::Yield)
    }

    /// Patch jumps and return the chunk.
    ///
    /// Fails when a label was never bound or a jump does not fit in an `i16`.
    pub fn finish(mut self) -> Result<Chunk> {
        for (offset, label) in std::mem::take(&mut self.patches) {
            let target = self.labels[label.0]
                .ok_or_else(|| Error::malformed(offset, format!("label {} never bound", label.0)))?;
            let rel = target as i64 - (offset as i64 + 3);
            let rel = i16::try_from(rel)
                .map_err(|_| Error::malformed(offset, format!("jump distance {} too large", rel)))?;
            let bytes = rel.to_le_bytes();
            self.chunk.code[offset + 1] = bytes[0];
            self.chunk.code[offset + 2] = bytes[1];
        }
        Ok(self.chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = ChunkBuilder::new("loop", 0);
        let i = b.local();
        let top = b.here();
        let done = b.new_label();
        b.get_local(i).number(10.0).lt().jump_if_false(done);
        b.get_local(i).number(1.0).add().set_local(i);
        b.jump(top);
        b.bind(done);
        b.get_local(i).ret();
        let chunk = b.finish().unwrap();

        let instructions = chunk.instructions().unwrap();
        let jumps: Vec<_> = instructions
            .iter()
            .filter_map(|(off, ins)| ins.jump_target().map(|t| (*off, t)))
            .collect();
        assert_eq!(jumps.len(), 2);
        // the backward jump goes to offset 0
        assert_eq!(jumps[1].1, 0);
        // the forward jump lands on GetLocal
        let landing = instructions.iter().find(|(off, _)| *off == jumps[0].1).unwrap();
        assert_eq!(landing.1, Instruction::GetLocal(i));
        assert_eq!(chunk.local_count, 1);
    }

    #[test]
    fn test_constant_dedup() {
        let mut b = ChunkBuilder::new("c", 0);
        b.number(1.0).number(1.0).string("x").get_named("x").pop().pop().pop();
        b.ret_undefined();
        let chunk = b.finish().unwrap();
        assert_eq!(chunk.constants.len(), 2);
        assert_eq!(chunk.call_sites.len(), 1);
        assert_eq!(chunk.call_sites[0].kind, SiteKind::NamedLoad);
    }

    #[test]
    fn test_unbound_label() {
        let mut b = ChunkBuilder::new("bad", 0);
        let l = b.new_label();
        b.jump(l);
        assert!(b.finish().is_err());
    }
}
