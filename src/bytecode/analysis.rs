//! Static analysis over a chunk
//!
//! The optimizing compiler needs three facts the interpreter never does: the
//! operand-stack height at every instruction, which locals are live, and
//! where the loops are. All three are computed here once per compilation.

use super::{Chunk, Instruction};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;

/// A small bitset over local indices
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalSet {
    words: [u64; 4],
}

impl LocalSet {
    pub fn insert(&mut self, local: u8) {
        self.words[(local / 64) as usize] |= 1 << (local % 64);
    }

    pub fn remove(&mut self, local: u8) {
        self.words[(local / 64) as usize] &= !(1 << (local % 64));
    }

    pub fn contains(&self, local: u8) -> bool {
        self.words[(local / 64) as usize] & (1 << (local % 64)) != 0
    }

    /// Union in place; returns whether anything changed
    pub fn union_with(&mut self, other: &LocalSet) -> bool {
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *a | *b;
            changed |= merged != *a;
            *a = merged;
        }
        changed
    }
}

/// A loop: a backward jump at `back_edge` targeting `header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    pub header: usize,
    pub back_edge: usize,
}

impl LoopRegion {
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.header && offset <= self.back_edge
    }
}

/// Per-chunk analysis results
#[derive(Debug)]
pub struct BytecodeAnalysis {
    /// Decoded instructions with their offsets, in code order
    pub instructions: Vec<(usize, Instruction)>,
    index: HashMap<usize, usize>,
    /// Stack height on entry, `None` for unreachable instructions
    heights: Vec<Option<usize>>,
    /// Locals live on entry to each instruction
    live_in: Vec<LocalSet>,
    jump_targets: Vec<bool>,
    pub loops: Vec<LoopRegion>,
    pub max_stack: usize,
}

impl BytecodeAnalysis {
    pub fn analyze(chunk: &Chunk) -> Result<Self> {
        let instructions = chunk.instructions()?;
        let index: HashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(i, (offset, _))| (*offset, i))
            .collect();

        let mut analysis = Self {
            heights: vec![None; instructions.len()],
            live_in: vec![LocalSet::default(); instructions.len()],
            jump_targets: vec![false; instructions.len()],
            instructions,
            index,
            loops: Vec::new(),
            max_stack: 0,
        };
        analysis.check_operands(chunk)?;
        analysis.find_jump_targets(chunk)?;
        analysis.compute_heights()?;
        analysis.compute_liveness();
        Ok(analysis)
    }

    fn check_operands(&self, chunk: &Chunk) -> Result<()> {
        for (offset, instruction) in &self.instructions {
            match instruction {
                Instruction::GetLocal(l) | Instruction::SetLocal(l) if *l >= chunk.local_count => {
                    return Err(Error::malformed(*offset, format!("local {} out of range", l)));
                }
                Instruction::LoadConst(c) if chunk.get_constant(*c).is_none() => {
                    return Err(Error::malformed(*offset, format!("constant {} out of range", c)));
                }
                Instruction::GetGlobal(c)
                | Instruction::SetGlobal(c)
                | Instruction::DefineNamed(c)
                | Instruction::GetNamed { name: c, .. }
                | Instruction::SetNamed { name: c, .. } => {
                    chunk.name_at(*c, *offset)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn find_jump_targets(&mut self, chunk: &Chunk) -> Result<()> {
        for i in 0..self.instructions.len() {
            let (offset, instruction) = self.instructions[i];
            let Some(target) = instruction.jump_target() else {
                continue;
            };
            if target == chunk.code.len() {
                continue;
            }
            let t = *self
                .index
                .get(&target)
                .ok_or_else(|| Error::malformed(offset, format!("jump into the middle of an instruction at {}", target)))?;
            self.jump_targets[t] = true;
            if target <= offset {
                self.loops.push(LoopRegion {
                    header: target,
                    back_edge: offset,
                });
            }
        }
        Ok(())
    }

    /// Successor instruction indices; `None` entries fall off the end
    fn successors(&self, i: usize) -> Vec<Option<usize>> {
        let (_, instruction) = self.instructions[i];
        let mut out = Vec::with_capacity(2);
        if !instruction.is_terminator() {
            out.push(if i + 1 < self.instructions.len() { Some(i + 1) } else { None });
        }
        if let Some(target) = instruction.jump_target() {
            out.push(self.index.get(&target).copied());
        }
        out
    }

    fn compute_heights(&mut self) -> Result<()> {
        if self.instructions.is_empty() {
            return Ok(());
        }
        self.heights[0] = Some(0);
        let mut worklist = vec![0usize];
        while let Some(i) = worklist.pop() {
            let (offset, instruction) = self.instructions[i];
            let height = self.heights[i].unwrap_or(0);
            let (pops, pushes) = instruction.stack_effect();
            if pops > height {
                return Err(Error::malformed(offset, "operand stack underflow"));
            }
            let after = height - pops + pushes;
            self.max_stack = self.max_stack.max(after).max(height);
            for successor in self.successors(i).into_iter().flatten() {
                match self.heights[successor] {
                    None => {
                        self.heights[successor] = Some(after);
                        worklist.push(successor);
                    }
                    Some(existing) if existing != after => {
                        return Err(Error::malformed(
                            self.instructions[successor].0,
                            format!("inconsistent stack height ({} vs {})", existing, after),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    fn compute_liveness(&mut self) {
        let n = self.instructions.len();
        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..n).rev() {
                let mut live = LocalSet::default();
                for successor in self.successors(i).into_iter().flatten() {
                    live.union_with(&self.live_in[successor]);
                }
                match self.instructions[i].1 {
                    Instruction::SetLocal(l) => live.remove(l),
                    Instruction::GetLocal(l) => live.insert(l),
                    _ => {}
                }
                if live != self.live_in[i] {
                    self.live_in[i] = live;
                    changed = true;
                }
            }
        }
    }

    /// Index of the instruction at `offset`
    pub fn index_of(&self, offset: usize) -> Option<usize> {
        self.index.get(&offset).copied()
    }

    pub fn height_at(&self, index: usize) -> Option<usize> {
        self.heights.get(index).copied().flatten()
    }

    pub fn is_reachable(&self, index: usize) -> bool {
        self.height_at(index).is_some()
    }

    pub fn is_jump_target(&self, index: usize) -> bool {
        self.jump_targets.get(index).copied().unwrap_or(false)
    }

    pub fn live_at(&self, index: usize) -> &LocalSet {
        &self.live_in[index]
    }

    /// Whether `offset` lies inside any loop
    pub fn in_loop(&self, offset: usize) -> bool {
        self.loops.iter().any(|l| l.contains(offset))
    }
}
