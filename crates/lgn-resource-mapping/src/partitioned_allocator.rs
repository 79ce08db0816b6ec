/// Out-of-space marker.
pub const INVALID_PARTITION_BLOCK: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct PartitionBlock {
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct SlackPartitionBlock {
    offset: usize,
    length: usize,
}

#[derive(Debug)]
struct PartitionMetadata {
    /// Number of blocks carved per leading allocation.
    block_count: usize,
    /// Number of elements per block.
    block_length: usize,
    free_blocks: Vec<PartitionBlock>,
}

/// Allocator partitioned by power-of-two request sizes, useful for
/// reducing fragmentation on allocations with known lengths. Requests past
/// the largest partition go through a slack-matched large-block list:
/// large blocks are reused when the stored length is within the slack
/// window of the request.
#[derive(Debug)]
pub struct PartitionedAllocator {
    partitions: Vec<PartitionMetadata>,
    free_slack_blocks: Vec<SlackPartitionBlock>,
    large_partition_slack: usize,
    region_offset: usize,
    region_length: usize,
}

impl PartitionedAllocator {
    pub fn new(partition_count: usize, partition_size: usize, large_partition_slack: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|level| {
                let block_length = 1usize << level;
                PartitionMetadata {
                    // Levels wider than the partition carve one block.
                    block_count: (partition_size / block_length).max(1),
                    block_length,
                    free_blocks: Vec::new(),
                }
            })
            .collect();

        Self {
            partitions,
            free_slack_blocks: Vec::new(),
            large_partition_slack,
            region_offset: 0,
            region_length: 0,
        }
    }

    /// Set the total element length backing the allocator.
    pub fn set_length(&mut self, length: usize) {
        self.region_length = length;
    }

    /// Allocate `count` elements.
    ///
    /// Returns [`INVALID_PARTITION_BLOCK`] when the region is out of space.
    pub fn allocate(&mut self, count: u32) -> usize {
        assert!(count > 0, "zero length allocations are not supported");

        let level = partition_level(count);
        if level >= self.partitions.len() {
            return self.allocate_slack_block(count);
        }

        let metadata = &mut self.partitions[level];
        debug_assert!(
            count as usize <= metadata.block_length
                && (level == 0 || count as usize > metadata.block_length / 2),
            "partition level mismatch"
        );

        if let Some(block) = metadata.free_blocks.pop() {
            return block.offset;
        }

        self.allocate_block_with_leading(level)
    }

    /// Free a block. `count` must match the allocation count.
    pub fn free(&mut self, offset: usize, count: u32) {
        let level = partition_level(count);
        if level >= self.partitions.len() {
            self.free_slack_block(offset, count);
            return;
        }

        self.partitions[level].free_blocks.push(PartitionBlock { offset });
    }

    /// Carve a whole partition from the region; the leading block services
    /// the request, the remainder joins the free list.
    fn allocate_block_with_leading(&mut self, level: usize) -> usize {
        let metadata = &mut self.partitions[level];
        let element_count = metadata.block_length * metadata.block_count;

        if self.region_offset + element_count > self.region_length {
            return INVALID_PARTITION_BLOCK;
        }

        let leading_offset = self.region_offset;
        self.region_offset += element_count;

        for block in 1..metadata.block_count {
            metadata.free_blocks.push(PartitionBlock {
                offset: leading_offset + metadata.block_length * block,
            });
        }

        leading_offset
    }

    fn allocate_slack_block(&mut self, count: u32) -> usize {
        let count = count as usize;
        let slack_high_bound = count + self.large_partition_slack;

        if self.region_offset + slack_high_bound > self.region_length {
            return INVALID_PARTITION_BLOCK;
        }

        // First stored block large enough for the request.
        let index = self
            .free_slack_blocks
            .partition_point(|block| block.length < count);

        // Appropriate when the distance to the edge stays within twice the
        // slack; anything looser wastes the block.
        if let Some(block) = self.free_slack_blocks.get(index) {
            if block.length >= count && block.length - count <= self.large_partition_slack * 2 {
                let block = self.free_slack_blocks.remove(index);
                return block.offset;
            }
        }

        let offset = self.region_offset;
        self.region_offset += slack_high_bound;
        offset
    }

    fn free_slack_block(&mut self, offset: usize, count: u32) {
        let length = count as usize + self.large_partition_slack;

        let index = self
            .free_slack_blocks
            .partition_point(|block| block.length <= length);
        self.free_slack_blocks
            .insert(index, SlackPartitionBlock { offset, length });
    }
}

/// Smallest power-of-two level covering `count`.
fn partition_level(count: u32) -> usize {
    assert!(count > 0, "zero length allocations are not supported");

    let msb = 31 - count.leading_zeros();
    let level = if count & !(1 << msb) != 0 { msb + 1 } else { msb };
    level as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_level_rounding() {
        assert_eq!(partition_level(1), 0);
        assert_eq!(partition_level(2), 1);
        assert_eq!(partition_level(3), 2);
        assert_eq!(partition_level(4), 2);
        assert_eq!(partition_level(5), 3);
        assert_eq!(partition_level(1024), 10);
    }

    #[test]
    fn test_allocate_reuses_freed_blocks() {
        let mut allocator = PartitionedAllocator::new(4, 64, 128);
        allocator.set_length(4096);

        let a = allocator.allocate(4);
        let b = allocator.allocate(4);
        assert_ne!(a, INVALID_PARTITION_BLOCK);
        assert_ne!(a, b);

        allocator.free(a, 4);
        let c = allocator.allocate(3);
        // Same level (both round to 4), so the freed block is reused.
        assert_eq!(c, a);
    }

    #[test]
    fn test_leading_block_carves_partition() {
        let mut allocator = PartitionedAllocator::new(4, 64, 128);
        allocator.set_length(4096);

        // Level 0 partitions carve 64 single-element blocks at once; the
        // next allocation comes from the carved free list, not the region.
        let a = allocator.allocate(1);
        let b = allocator.allocate(1);
        assert_eq!(a, 0);
        assert!(b < 64);
    }

    #[test]
    fn test_slack_block_reuse_window() {
        let mut allocator = PartitionedAllocator::new(2, 8, 16);
        allocator.set_length(10_000);

        // Past the largest partition: slack path.
        let a = allocator.allocate(100);
        assert_ne!(a, INVALID_PARTITION_BLOCK);

        allocator.free(a, 100);

        // Within the reuse window of the stored block.
        let b = allocator.allocate(110);
        assert_eq!(b, a);

        // Far below the stored length: stored block is too loose.
        let c = allocator.allocate(40);
        assert_ne!(c, a);
    }

    #[test]
    fn test_out_of_space() {
        let mut allocator = PartitionedAllocator::new(4, 8, 4);
        allocator.set_length(8);

        assert_ne!(allocator.allocate(8), INVALID_PARTITION_BLOCK);
        assert_eq!(allocator.allocate(8), INVALID_PARTITION_BLOCK);
    }
}
