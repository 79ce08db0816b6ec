use fnv::FnvHashMap;

use crate::{BasicBlock, BlockId, FunctionId, IdAllocator, TypeId, ValueId};

/// A function: parameters, local variables, and an ordered block list.
///
/// The block order is the emission order; the entry block is the first one.
/// Mutating accessors mark the function dirty, which is what tells a codec
/// it can no longer emit the original bytes for it.
#[derive(Debug)]
pub struct Function {
    id: FunctionId,
    function_type: TypeId,
    parameters: Vec<ValueId>,
    local_variables: Vec<ValueId>,
    blocks: Vec<BasicBlock>,
    block_lookup: FnvHashMap<BlockId, usize>,
    dirty: bool,
}

impl Function {
    pub fn new(id: FunctionId, function_type: TypeId) -> Self {
        Self {
            id,
            function_type,
            parameters: Vec::new(),
            local_variables: Vec::new(),
            blocks: Vec::new(),
            block_lookup: FnvHashMap::default(),
            dirty: false,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn function_type(&self) -> TypeId {
        self.function_type
    }

    pub fn parameters(&self) -> &[ValueId] {
        &self.parameters
    }

    pub fn add_parameter(&mut self, value: ValueId) {
        self.parameters.push(value);
    }

    pub fn local_variables(&self) -> &[ValueId] {
        &self.local_variables
    }

    pub fn add_local_variable(&mut self, value: ValueId) {
        self.local_variables.push(value);
    }

    /// Allocate a new empty block at the end of the function.
    pub fn alloc_block(&mut self, ids: &mut IdAllocator) -> BlockId {
        let id = ids.allocate_block();
        self.block_lookup.insert(id, self.blocks.len());
        self.blocks.push(BasicBlock::new(id));
        self.dirty = true;
        id
    }

    /// Append a block parsed from a binary, keeping its original id.
    pub fn add_existing_block(&mut self, block: BasicBlock) {
        self.block_lookup.insert(block.id(), self.blocks.len());
        self.blocks.push(block);
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.block_lookup.get(&id).map(|i| &self.blocks[*i])
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.dirty = true;
        let index = *self.block_lookup.get(&id)?;
        Some(&mut self.blocks[index])
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Split `block` at `index`: the instructions at `[index..]` move into a
    /// fresh block, which is returned. The source block is left without a
    /// terminator; the caller is expected to emit one.
    ///
    /// Returns `None` if the block does not exist or the index is out of
    /// bounds.
    pub fn split_block(
        &mut self,
        block: BlockId,
        index: usize,
        ids: &mut IdAllocator,
    ) -> Option<BlockId> {
        let source_index = *self.block_lookup.get(&block)?;
        if index > self.blocks[source_index].len() {
            return None;
        }

        let resume = ids.allocate_block();
        let mut resume_block = BasicBlock::new(resume);
        self.blocks[source_index].split_into(index, &mut resume_block);

        // Keep the resume block adjacent to its source so emission order
        // stays plausible for structured control flow.
        self.blocks.insert(source_index + 1, resume_block);
        self.rebuild_lookup();
        self.dirty = true;
        Some(resume)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn rebuild_lookup(&mut self) {
        self.block_lookup.clear();
        for (index, block) in self.blocks.iter().enumerate() {
            self.block_lookup.insert(block.id(), index);
        }
    }
}
