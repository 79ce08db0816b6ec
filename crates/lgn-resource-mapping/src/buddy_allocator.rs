/// Maximum number of power-of-two levels.
pub const MAX_LEVELS: usize = 34;

const INVALID_LEVEL: u32 = u32::MAX;
const INVALID_NODE: u32 = u32::MAX;
const INVALID_SLOT: u32 = u32::MAX;

/// An allocated region: its element offset and the leaf node backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyAllocation {
    pub offset: u64,
    pub node_index: u32,
}

/// Out-of-space marker.
pub const INVALID_BUDDY_ALLOCATION: BuddyAllocation = BuddyAllocation {
    offset: u64::MAX,
    node_index: INVALID_NODE,
};

impl BuddyAllocation {
    pub fn is_valid(&self) -> bool {
        self.node_index != INVALID_NODE
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    offset: u64,
    level: u32,
    parent: u32,
    free_slot: u32,
    lhs: u32,
    rhs: u32,
}

impl Node {
    fn reset() -> Self {
        Self {
            offset: 0,
            level: 0,
            parent: INVALID_NODE,
            free_slot: INVALID_SLOT,
            lhs: INVALID_NODE,
            rhs: INVALID_NODE,
        }
    }
}

/// Power-of-two buddy allocator with a pooled node store. Nodes subdivide
/// on demand during allocation; freed nodes return to their level's free
/// list and destroyed nodes to the pool for reuse.
pub struct BuddyAllocator {
    nodes: Vec<Node>,
    levels: Vec<Vec<u32>>,
    free_node_indices: Vec<u32>,
}

impl BuddyAllocator {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            levels: vec![Vec::new(); MAX_LEVELS],
            free_node_indices: Vec::new(),
        }
    }

    /// Install the allocator over `size` elements. A size that is not a
    /// power of two is snapped down to the previous one.
    pub fn install(&mut self, mut size: u64) {
        if size & (size.wrapping_sub(1)) != 0 {
            size = 1u64 << (bit_width(size) - 1);
        }

        let root_level = level_of(size);
        let root_node = self.allocate_node(INVALID_NODE, 0, root_level);
        self.push_free(root_level, root_node);
    }

    /// Allocate a region of `length` elements.
    ///
    /// Returns [`INVALID_BUDDY_ALLOCATION`] when no level has a free node,
    /// whether from exhaustion or internal fragmentation.
    pub fn allocate(&mut self, length: u64) -> BuddyAllocation {
        let low_level = level_of(length);

        let available_level = match self.first_available_level(low_level) {
            Some(level) => level,
            None => return INVALID_BUDDY_ALLOCATION,
        };

        let mut node_index = match self.pop_free(available_level) {
            Some(index) => index,
            None => return INVALID_BUDDY_ALLOCATION,
        };

        // Traverse down to the requested level, subdividing as needed.
        let mut level = available_level;
        while level != low_level {
            if self.nodes[node_index as usize].lhs == INVALID_NODE {
                let next_level = level - 1;
                let offset = self.nodes[node_index as usize].offset;

                let lhs = self.allocate_node(node_index, offset, next_level);
                let rhs =
                    self.allocate_node(node_index, offset + (1u64 << next_level), next_level);
                self.nodes[node_index as usize].lhs = lhs;
                self.nodes[node_index as usize].rhs = rhs;
            }

            let rhs = self.nodes[node_index as usize].rhs;
            self.push_free(level - 1, rhs);

            node_index = self.nodes[node_index as usize].lhs;
            level -= 1;
        }

        debug_assert!(
            length <= 1u64 << self.nodes[node_index as usize].level,
            "node level below the request"
        );

        BuddyAllocation {
            offset: self.nodes[node_index as usize].offset,
            node_index,
        }
    }

    /// Free an allocation. Expects the leaf node handed out by
    /// [`BuddyAllocator::allocate`].
    pub fn free(&mut self, allocation: &BuddyAllocation) {
        debug_assert!(
            self.nodes[allocation.node_index as usize].lhs == INVALID_NODE,
            "expected a leaf node"
        );
        self.free_node_recursive(allocation.node_index);
    }

    fn free_node_recursive(&mut self, node_index: u32) {
        // Destroy the children.
        let (lhs, rhs) = {
            let node = &self.nodes[node_index as usize];
            (node.lhs, node.rhs)
        };
        if lhs != INVALID_NODE {
            self.destroy_free_node(lhs);
            self.destroy_free_node(rhs);
            let node = &mut self.nodes[node_index as usize];
            node.lhs = INVALID_NODE;
            node.rhs = INVALID_NODE;
        }

        let level = self.nodes[node_index as usize].level;
        self.push_free(level, node_index);

        // TODO: merge fully-free parents upward. The naive recursion here
        // would collapse a parent whose other child is merely allocated
        // (not on the free list); collapsing needs an is-free check on
        // both children first.
    }

    fn destroy_free_node(&mut self, node_index: u32) {
        debug_assert!(self.is_free(node_index), "destroying a non-free node");

        self.remove_from_free(node_index);
        self.nodes[node_index as usize] = Node::reset();
        self.free_node_indices.push(node_index);
    }

    fn is_free(&self, node_index: u32) -> bool {
        self.nodes[node_index as usize].free_slot != INVALID_SLOT
    }

    fn allocate_node(&mut self, parent: u32, offset: u64, level: u32) -> u32 {
        let index = match self.free_node_indices.pop() {
            Some(index) => index,
            None => {
                let index = self.nodes.len() as u32;
                self.nodes.push(Node::reset());
                index
            }
        };

        let node = &mut self.nodes[index as usize];
        node.offset = offset;
        node.level = level;
        node.parent = parent;
        node.free_slot = INVALID_SLOT;
        node.lhs = INVALID_NODE;
        node.rhs = INVALID_NODE;
        index
    }

    fn push_free(&mut self, level: u32, node_index: u32) {
        self.nodes[node_index as usize].free_slot = self.levels[level as usize].len() as u32;
        self.levels[level as usize].push(node_index);
    }

    fn pop_free(&mut self, level: u32) -> Option<u32> {
        let index = self.levels[level as usize].pop()?;
        self.nodes[index as usize].free_slot = INVALID_SLOT;
        Some(index)
    }

    /// Swap-remove a node from its level's free list, patching the moved
    /// node's slot.
    fn remove_from_free(&mut self, node_index: u32) {
        let (level, slot) = {
            let node = &self.nodes[node_index as usize];
            (node.level as usize, node.free_slot as usize)
        };

        let last = self.levels[level].len() - 1;
        if slot != last {
            let moved = self.levels[level][last];
            self.levels[level][slot] = moved;
            self.nodes[moved as usize].free_slot = slot as u32;
        }

        self.levels[level].pop();
        self.nodes[node_index as usize].free_slot = INVALID_SLOT;
    }

    fn first_available_level(&self, low_level: u32) -> Option<u32> {
        (low_level..MAX_LEVELS as u32).find(|level| !self.levels[*level as usize].is_empty())
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn bit_width(value: u64) -> u32 {
    64 - value.leading_zeros()
}

/// Level covering a width: `bit_width(max(1, width - 1))`.
fn level_of(width: u64) -> u32 {
    debug_assert!(width < (1u64 << MAX_LEVELS), "out of levels");
    bit_width(width.saturating_sub(1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_of() {
        assert_eq!(level_of(1), 1);
        assert_eq!(level_of(2), 1);
        assert_eq!(level_of(3), 2);
        assert_eq!(level_of(4), 2);
        assert_eq!(level_of(5), 3);
        assert_eq!(level_of(1 << 20), 20);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut allocator = BuddyAllocator::new();
        allocator.install(1 << 10);

        let mut allocations = Vec::new();
        for _ in 0..16 {
            let allocation = allocator.allocate(64);
            assert!(allocation.is_valid());
            allocations.push(allocation);
        }

        // 16 * 64 fills the region exactly; all offsets distinct.
        let mut offsets: Vec<u64> = allocations.iter().map(|a| a.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 16);

        assert!(!allocator.allocate(64).is_valid());
    }

    #[test]
    fn test_free_allows_same_level_reuse() {
        let mut allocator = BuddyAllocator::new();
        allocator.install(256);

        let a = allocator.allocate(64);
        let b = allocator.allocate(64);
        assert!(a.is_valid() && b.is_valid());

        allocator.free(&a);
        let c = allocator.allocate(64);
        assert!(c.is_valid());
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn test_merge_upward_stays_disabled() {
        let mut allocator = BuddyAllocator::new();
        allocator.install(256);

        // Split the region down to 64s, then free them all.
        let allocations: Vec<_> = (0..4).map(|_| allocator.allocate(64)).collect();
        for allocation in &allocations {
            allocator.free(allocation);
        }

        // Without upward merging the root is never reconstituted, so a
        // full-region request cannot be serviced even though every leaf is
        // free again.
        assert!(!allocator.allocate(256).is_valid());

        // The leaves themselves remain reusable.
        assert!(allocator.allocate(64).is_valid());
    }

    #[test]
    fn test_non_pow2_install_snaps_down() {
        let mut allocator = BuddyAllocator::new();
        allocator.install(300);

        // Snapped to 256.
        let a = allocator.allocate(256);
        assert!(a.is_valid());
        assert!(!allocator.allocate(1).is_valid());
    }
}
