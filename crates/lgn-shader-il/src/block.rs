use bitflags::bitflags;

use crate::{BlockId, Instruction};

bitflags! {
    /// Per-block markers consumed by the instrumentation passes.
    pub struct BlockFlags: u32 {
        /// Injected block that must not be instrumented again.
        const NO_INSTRUMENTATION = 1 << 0;
    }
}

/// A basic block: an id and an ordered instruction list, terminated by a
/// branch-like instruction once construction is complete.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    id: BlockId,
    pub flags: BlockFlags,
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            flags: BlockFlags::empty(),
            instructions: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The block terminator, if the block is complete.
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.is_terminator())
    }

    /// Move the instructions at `[index..]` into `target`, leaving this
    /// block open for a new terminator. Used by injectors to interpose
    /// checks before an instruction.
    pub(crate) fn split_into(&mut self, index: usize, target: &mut BasicBlock) {
        debug_assert!(index <= self.instructions.len(), "split out of bounds");
        target.instructions = self.instructions.split_off(index);
    }
}
