//! The physical resource mapping table.
//!
//! A GPU-resident array of [`VirtualResourceMapping`] indexed by offset
//! within a descriptor heap type. Application-visible descriptor ranges are
//! backed by segments from a partitioned allocator; instrumented shaders
//! read the device copy, the layer writes the host copy and commits it per
//! queue through the pre-patch command buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lgn_gpu_api::{
    Buffer, BufferDesc, BufferUsage, CommandBuffer, DescriptorHeapType, DeviceContext,
    MirrorAllocation, Residency,
};

use crate::{
    report_fatal_exhaustion, PartitionedAllocator, ResourceError, Result,
    VirtualResourceMapping, INVALID_PARTITION_BLOCK,
};

const GROWTH_FLOOR: u32 = 64_000;

/// Opaque id of an allocated descriptor segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalResourceSegmentId(pub u32);

/// Per-queue commit tracking. The device copy is refreshed on a queue only
/// when the table's commit head has advanced past the queue's.
pub struct PrmtQueueState {
    commit_head: AtomicU64,
}

impl PrmtQueueState {
    fn new() -> Self {
        Self {
            commit_head: AtomicU64::new(0),
        }
    }

    pub fn commit_head(&self) -> u64 {
        self.commit_head.load(Ordering::Acquire)
    }
}

/// Shader-facing view of a segment: its absolute base and length.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: u32,
    length: u32,
    destroyed: bool,
}

struct PersistentVersion {
    allocation: MirrorAllocation,
    mapping_count: u32,
}

struct TableInner {
    commit_head: u64,
    mapping_count: u32,
    allocator: PartitionedAllocator,
    segments: Vec<Segment>,
    indices: Vec<u32>,
    free_indices: Vec<u32>,
    live_segment_count: u32,
    /// State tags per absolute offset, for CPU-side inspection.
    states: Vec<u64>,
    version: Option<PersistentVersion>,
    /// Older versions kept until every queue's head passes the resize
    /// point they were retired at.
    retired: Vec<(u64, PersistentVersion)>,
    queues: Vec<Arc<PrmtQueueState>>,
}

/// One mapping table; the backend owns one per descriptor heap type.
pub struct PhysicalResourceMappingTable {
    device: DeviceContext,
    heap_type: DescriptorHeapType,
    inner: Mutex<TableInner>,
}

impl PhysicalResourceMappingTable {
    pub fn new(device: DeviceContext, heap_type: DescriptorHeapType) -> Result<Self> {
        let table = Self {
            device,
            heap_type,
            inner: Mutex::new(TableInner {
                commit_head: 0,
                mapping_count: 0,
                allocator: PartitionedAllocator::new(12, 4096, 512),
                segments: Vec::new(),
                indices: Vec::new(),
                free_indices: Vec::new(),
                live_segment_count: 0,
                states: Vec::new(),
                version: None,
                retired: Vec::new(),
                queues: Vec::new(),
            }),
        };

        // Dummy allocation pinning offset zero: the null descriptor index
        // resolves to an invalid mapping without extra shader guards.
        table.allocate(4)?;

        Ok(table)
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Register a queue with the table, returning its commit state.
    pub fn register_queue_state(&self) -> Arc<PrmtQueueState> {
        let state = Arc::new(PrmtQueueState::new());
        self.inner.lock().unwrap().queues.push(Arc::clone(&state));
        state
    }

    /// Allocate a segment covering `count` descriptors.
    ///
    /// # Errors
    ///
    /// Fatal exhaustion when growth would pass the device's buffer element
    /// limit; see [`ResourceError::Exhausted`].
    pub fn allocate(&self, count: u32) -> Result<PhysicalResourceSegmentId> {
        let mut inner = self.inner.lock().unwrap();

        let mut offset = inner.allocator.allocate(count);
        if offset == INVALID_PARTITION_BLOCK {
            let needed = inner.mapping_count + count;
            self.grow_table(&mut inner, needed)?;

            offset = inner.allocator.allocate(count);
            assert_ne!(
                offset, INVALID_PARTITION_BLOCK,
                "partition re-allocation failed after growth"
            );
        }

        let id = match inner.free_indices.pop() {
            Some(id) => id,
            None => {
                let id = inner.indices.len() as u32;
                inner.indices.push(0);
                id
            }
        };

        let segment_index = inner.segments.len() as u32;
        inner.indices[id as usize] = segment_index;
        inner.segments.push(Segment {
            offset: offset as u32,
            length: count,
            destroyed: false,
        });
        inner.live_segment_count += 1;

        Ok(PhysicalResourceSegmentId(id))
    }

    /// Free a segment; its entries must have been invalidated first.
    pub fn free(&self, id: PhysicalResourceSegmentId) {
        let mut inner = self.inner.lock().unwrap();

        let index = inner.indices[id.0 as usize] as usize;
        let segment = inner.segments[index];
        inner.allocator.free(segment.offset as usize, segment.length);

        // Trailing segments need no tombstone.
        if index + 1 == inner.segments.len() {
            inner.segments.pop();
        } else {
            inner.segments[index].destroyed = true;
        }

        inner.live_segment_count -= 1;
        inner.free_indices.push(id.0);
    }

    /// Write one mapping at a segment-relative offset.
    pub fn write_mapping(
        &self,
        id: PhysicalResourceSegmentId,
        offset: u32,
        mapping: &VirtualResourceMapping,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let absolute = Self::absolute_offset(&inner, id, offset);
        Self::write_host(&inner, absolute, mapping);
        inner.commit_head += 1;
    }

    /// Write one mapping and tag the slot with a resource state for
    /// CPU-side lookups. Equivalent to [`Self::write_mapping`] on the
    /// device side; the call sites stay distinguishable on purpose.
    pub fn write_mapping_with_state(
        &self,
        id: PhysicalResourceSegmentId,
        offset: u32,
        state: u64,
        mapping: &VirtualResourceMapping,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let absolute = Self::absolute_offset(&inner, id, offset);
        Self::write_host(&inner, absolute, mapping);
        inner.states[absolute as usize] = state;
        inner.commit_head += 1;
    }

    /// Host-side copy of a whole segment onto another of equal length.
    pub fn copy_mappings(
        &self,
        source: PhysicalResourceSegmentId,
        dest: PhysicalResourceSegmentId,
    ) {
        let mut inner = self.inner.lock().unwrap();

        let source_segment = inner.segments[inner.indices[source.0 as usize] as usize];
        let dest_segment = inner.segments[inner.indices[dest.0 as usize] as usize];
        assert_eq!(
            source_segment.length, dest_segment.length,
            "segment length mismatch"
        );

        let version = inner.version.as_ref().expect("table installed");
        let byte_length = source_segment.length as usize * VirtualResourceMapping::BYTE_SIZE;
        let mut staging = vec![0u8; byte_length];
        version
            .allocation
            .host
            .read(
                source_segment.offset as u64 * VirtualResourceMapping::BYTE_SIZE as u64,
                &mut staging,
            )
            .expect("host mirror read");
        version
            .allocation
            .host
            .write(
                dest_segment.offset as u64 * VirtualResourceMapping::BYTE_SIZE as u64,
                &staging,
            )
            .expect("host mirror write");

        inner.commit_head += 1;
    }

    /// CPU-side inspection of a mapping; shader reads go through the
    /// device copy.
    pub fn get_mapping(
        &self,
        id: PhysicalResourceSegmentId,
        offset: u32,
    ) -> VirtualResourceMapping {
        let inner = self.inner.lock().unwrap();
        let absolute = Self::absolute_offset(&inner, id, offset);

        let mut bytes = [0u8; VirtualResourceMapping::BYTE_SIZE];
        inner
            .version
            .as_ref()
            .expect("table installed")
            .allocation
            .host
            .read(
                u64::from(absolute) * VirtualResourceMapping::BYTE_SIZE as u64,
                &mut bytes,
            )
            .expect("host mirror read");
        VirtualResourceMapping::decode(&bytes)
    }

    /// State tag recorded by [`Self::write_mapping_with_state`].
    pub fn get_mapping_state(&self, id: PhysicalResourceSegmentId, offset: u32) -> u64 {
        let inner = self.inner.lock().unwrap();
        let absolute = Self::absolute_offset(&inner, id, offset);
        inner.states[absolute as usize]
    }

    /// Segment view for shader-side binding.
    pub fn segment_view(&self, id: PhysicalResourceSegmentId) -> SegmentView {
        let inner = self.inner.lock().unwrap();
        let segment = inner.segments[inner.indices[id.0 as usize] as usize];
        SegmentView {
            offset: segment.offset,
            length: segment.length,
        }
    }

    /// Device-resident table buffer for the current version.
    pub fn device_buffer(&self) -> Buffer {
        self.inner
            .lock()
            .unwrap()
            .version
            .as_ref()
            .expect("table installed")
            .allocation
            .device
            .clone()
    }

    /// Record the host-to-device refresh for a queue, if its head is
    /// behind. The copy is elided when nothing changed or no segment is
    /// live.
    pub fn update(&self, command_buffer: &mut CommandBuffer, queue_state: &PrmtQueueState) {
        let mut inner = self.inner.lock().unwrap();

        self.release_retired(&mut inner);

        if inner.commit_head == queue_state.commit_head.load(Ordering::Acquire)
            || inner.live_segment_count == 0
        {
            return;
        }

        let version = inner.version.as_ref().expect("table installed");
        let byte_size =
            u64::from(version.mapping_count) * VirtualResourceMapping::BYTE_SIZE as u64;

        command_buffer.copy_buffer(
            &version.allocation.host,
            &version.allocation.device,
            0,
            0,
            byte_size,
        );
        // Flush the copy for shader reads.
        command_buffer.memory_barrier();

        queue_state
            .commit_head
            .store(inner.commit_head, Ordering::Release);
    }

    fn absolute_offset(inner: &TableInner, id: PhysicalResourceSegmentId, offset: u32) -> u32 {
        let segment = inner.segments[inner.indices[id.0 as usize] as usize];
        assert!(
            offset < segment.length,
            "physical segment offset out of bounds"
        );
        segment.offset + offset
    }

    fn write_host(inner: &TableInner, absolute: u32, mapping: &VirtualResourceMapping) {
        let mut bytes = [0u8; VirtualResourceMapping::BYTE_SIZE];
        mapping.encode(&mut bytes);
        inner
            .version
            .as_ref()
            .expect("table installed")
            .allocation
            .host
            .write(
                u64::from(absolute) * VirtualResourceMapping::BYTE_SIZE as u64,
                &bytes,
            )
            .expect("host mirror write");
    }

    /// Grow to hold at least `needed` mappings, migrating the current
    /// version and retiring it against the commit head.
    fn grow_table(&self, inner: &mut TableInner, needed: u32) -> Result<()> {
        let limit = self.device.capability_table().buffer_max_element_count;
        if u64::from(needed) > limit {
            report_fatal_exhaustion(
                "Descriptor Mapping Exhaustion",
                &format!(
                    "the resource mapping table cannot grow to {} entries over a device limit \
                     of {}; disable texel addressing or reduce the descriptor workload",
                    needed, limit
                ),
            );
            return Err(ResourceError::Exhausted {
                what: "physical resource mapping table",
                requested: u64::from(needed),
                capacity: limit,
            });
        }

        let migrated_count = inner.mapping_count;
        let new_count =
            (GROWTH_FLOOR.max(needed.saturating_mul(3) / 2) as u64).min(limit) as u32;

        inner.mapping_count = new_count;
        inner.allocator.set_length(new_count as usize);

        let allocation = self.device.create_mirror_allocation(&BufferDesc {
            size: u64::from(new_count) * VirtualResourceMapping::BYTE_SIZE as u64,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            residency: Residency::Device,
        })?;

        // Migrate the host copy and dummy-initialize the tail.
        if let Some(previous) = inner.version.take() {
            let byte_count = migrated_count as usize * VirtualResourceMapping::BYTE_SIZE;
            let mut staging = vec![0u8; byte_count];
            previous
                .allocation
                .host
                .read(0, &mut staging)
                .expect("host mirror read");
            allocation.host.write(0, &staging).expect("host mirror write");

            let retire_head = inner.commit_head;
            inner.retired.push((retire_head, previous));
        }

        let mut invalid = [0u8; VirtualResourceMapping::BYTE_SIZE];
        VirtualResourceMapping::invalid().encode(&mut invalid);

        let mut tail =
            vec![0u8; (new_count - migrated_count) as usize * VirtualResourceMapping::BYTE_SIZE];
        for chunk in tail.chunks_exact_mut(VirtualResourceMapping::BYTE_SIZE) {
            chunk.copy_from_slice(&invalid);
        }
        allocation
            .host
            .write(
                u64::from(migrated_count) * VirtualResourceMapping::BYTE_SIZE as u64,
                &tail,
            )
            .expect("host mirror write");

        inner.states.resize(new_count as usize, 0);
        inner.version = Some(PersistentVersion {
            allocation,
            mapping_count: new_count,
        });

        // A resize invalidates every queue's view.
        inner.commit_head += 1;

        log::debug!(
            "resource mapping table for {:?} grown to {} entries",
            self.heap_type,
            new_count
        );

        Ok(())
    }

    fn release_retired(&self, inner: &mut TableInner) {
        if inner.retired.is_empty() {
            return;
        }

        let min_head = inner
            .queues
            .iter()
            .map(|q| q.commit_head.load(Ordering::Acquire))
            .min()
            .unwrap_or(u64::MAX);

        inner.retired.retain(|(retire_head, _)| *retire_head >= min_head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResourceToken, ResourceTypeTag};
    use lgn_gpu_api::backends::null::NullDevice;
    use lgn_gpu_api::{CapabilityTable, QueueType};

    fn mapping(puid: u32) -> VirtualResourceMapping {
        VirtualResourceMapping {
            token: ResourceToken {
                puid,
                resource_type: ResourceTypeTag::Buffer,
                srb: 0,
            },
            ..VirtualResourceMapping::invalid()
        }
    }

    fn table() -> (NullDevice, PhysicalResourceMappingTable) {
        let device = NullDevice::new();
        let table = PhysicalResourceMappingTable::new(
            device.context(),
            DescriptorHeapType::ResourceView,
        )
        .unwrap();
        (device, table)
    }

    #[test]
    fn test_write_then_read_host() {
        let (_device, table) = table();

        let segment = table.allocate(16).unwrap();
        table.write_mapping(segment, 5, &mapping(42));

        let read = table.get_mapping(segment, 5);
        assert_eq!(read.token.puid, 42);
        assert_eq!(read.token.resource_type, ResourceTypeTag::Buffer);
    }

    #[test]
    fn test_update_commits_to_device_once() {
        let (device, table) = table();
        let context = device.context();
        let queue_state = table.register_queue_state();

        let segment = table.allocate(16).unwrap();
        table.write_mapping(segment, 5, &mapping(42));

        let view = table.segment_view(segment);

        let mut command_buffer = context.create_command_buffer();
        table.update(&mut command_buffer, &queue_state);
        assert!(!command_buffer.is_empty());
        context
            .queue(QueueType::Graphics)
            .submit(std::slice::from_ref(&command_buffer), None)
            .unwrap();

        // The device copy now resolves the absolute offset.
        let mut bytes = [0u8; VirtualResourceMapping::BYTE_SIZE];
        table
            .device_buffer()
            .read(
                u64::from(view.offset + 5) * VirtualResourceMapping::BYTE_SIZE as u64,
                &mut bytes,
            )
            .unwrap();
        assert_eq!(VirtualResourceMapping::decode(&bytes).token.puid, 42);

        // Head caught up: the next update elides the copy.
        let mut second = context.create_command_buffer();
        table.update(&mut second, &queue_state);
        assert!(second.is_empty());
    }

    #[test]
    fn test_state_tagged_writes() {
        let (_device, table) = table();

        let segment = table.allocate(8).unwrap();
        table.write_mapping_with_state(segment, 3, 0xAB, &mapping(7));

        assert_eq!(table.get_mapping_state(segment, 3), 0xAB);
        assert_eq!(table.get_mapping(segment, 3).token.puid, 7);
    }

    #[test]
    fn test_copy_mappings() {
        let (_device, table) = table();

        let source = table.allocate(4).unwrap();
        let dest = table.allocate(4).unwrap();
        table.write_mapping(source, 0, &mapping(9));
        table.copy_mappings(source, dest);

        assert_eq!(table.get_mapping(dest, 0).token.puid, 9);
    }

    #[test]
    fn test_segment_reuse_after_free() {
        let (_device, table) = table();

        let first = table.allocate(32).unwrap();
        let offset = table.segment_view(first).offset;
        table.free(first);

        let second = table.allocate(32).unwrap();
        assert_eq!(table.segment_view(second).offset, offset);
    }

    #[test]
    fn test_growth_past_limit_is_fatal() {
        let device = NullDevice::with_capabilities(CapabilityTable {
            buffer_max_element_count: 8192,
        });
        let table = PhysicalResourceMappingTable::new(
            device.context(),
            DescriptorHeapType::Sampler,
        )
        .unwrap();

        assert!(matches!(
            table.allocate(100_000),
            Err(ResourceError::Exhausted { .. })
        ));
    }
}
