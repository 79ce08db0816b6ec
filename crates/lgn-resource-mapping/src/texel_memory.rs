//! Texel memory: one sparse buffer of `u32` words in which every tracked
//! texel owns a bit, fronted by a buddy allocator and a tile residency
//! tracker that only maps the tiles live allocations cover.

use std::sync::Mutex;

use lgn_gpu_api::{Buffer, BufferDesc, BufferUsage, CommandBuffer, DeviceContext, Residency};

use crate::{
    compute_address_info, report_fatal_exhaustion, AddressInfo, BuddyAllocation, BuddyAllocator,
    ResourceError, ResourceInfo, Result,
};

/// Header dword layout preceding each allocation's data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TexelMemoryField {
    SubresourceCount = 0,
    FailureBlock = 1,
    TexelCount = 2,
    SubresourceOffsetStart = 3,
}

/// Backing-store tile size in bytes.
const TILE_SIZE: u64 = 64 * 1024;

/// Texel blocks hold 32 texels each; the default tracks the full index
/// space the format can address.
const MAX_TRACKED_TEXEL_BLOCKS: u64 = u32::MAX as u64;
const MAX_TRACKED_TEXELS: u64 = MAX_TRACKED_TEXEL_BLOCKS * 32;

/// One resource's region: header dwords, then one bit per texel, then a
/// safety dword absorbing aligned-chain rounding on region writes.
#[derive(Debug, Clone)]
pub struct TexelMemoryAllocation {
    pub address_info: AddressInfo,
    pub texel_block_count: u32,
    pub header_dword_count: u32,
    pub buddy: BuddyAllocation,
    pub texel_base_block: u32,
}

impl TexelMemoryAllocation {
    /// First data dword of the allocation.
    pub fn data_base_dword(&self) -> u32 {
        self.texel_base_block + self.header_dword_count
    }
}

#[derive(Debug, Clone, Copy)]
struct TileMappingRequest {
    tile_offset: u32,
    tile_count: u32,
}

/// Tracks which backing tiles are resident and batches mapping requests
/// for the scheduler.
struct TileResidencyAllocator {
    mapped: Vec<bool>,
    requests: Vec<TileMappingRequest>,
}

impl TileResidencyAllocator {
    fn install(byte_size: u64) -> Self {
        let tile_count = (byte_size + TILE_SIZE - 1) / TILE_SIZE;
        Self {
            mapped: vec![false; tile_count as usize],
            requests: Vec::new(),
        }
    }

    fn allocate(&mut self, byte_offset: u64, byte_size: u64) {
        let first = (byte_offset / TILE_SIZE) as usize;
        let last = ((byte_offset + byte_size + TILE_SIZE - 1) / TILE_SIZE) as usize;

        let mut run_start = None;
        for tile in first..last.min(self.mapped.len()) {
            if !self.mapped[tile] {
                self.mapped[tile] = true;
                if run_start.is_none() {
                    run_start = Some(tile);
                }
            } else if let Some(start) = run_start.take() {
                self.requests.push(TileMappingRequest {
                    tile_offset: start as u32,
                    tile_count: (tile - start) as u32,
                });
            }
        }

        if let Some(start) = run_start {
            self.requests.push(TileMappingRequest {
                tile_offset: start as u32,
                tile_count: (last.min(self.mapped.len()) - start) as u32,
            });
        }
    }

    fn drain_requests(&mut self) -> Vec<TileMappingRequest> {
        std::mem::take(&mut self.requests)
    }
}

struct TexelMemoryInner {
    buddy: BuddyAllocator,
    residency: TileResidencyAllocator,
}

/// The global texel tracking allocator.
pub struct TexelMemoryAllocator {
    buffer: Buffer,
    block_capacity: u64,
    texel_capacity: u64,
    inner: Mutex<TexelMemoryInner>,
}

impl TexelMemoryAllocator {
    /// Install the allocator for up to `requested_texels` tracked texels
    /// (0 selects the format maximum), clamped to the device's buffer
    /// element limit.
    ///
    /// # Errors
    ///
    /// Fails when the backing buffer cannot be created.
    pub fn install(device: &DeviceContext, requested_texels: u64) -> Result<Self> {
        let requested = if requested_texels == 0 {
            MAX_TRACKED_TEXELS
        } else {
            requested_texels
        };

        let block_count = (requested + 31) / 32;

        // Snap to the next power of two, then clamp against hardware.
        let mut block_capacity = block_count.saturating_sub(1).next_power_of_two().max(1);

        let hardware_limit = device.capability_table().buffer_max_element_count;
        if block_capacity > hardware_limit {
            block_capacity = prev_power_of_two(hardware_limit);
        }

        // Always one below the power of two to stay within numeric limits.
        block_capacity -= 1;

        let texel_capacity = block_capacity * 32;

        let mut buddy = BuddyAllocator::new();
        buddy.install(block_capacity + 1);

        let residency = TileResidencyAllocator::install(block_capacity * 4);

        let buffer = device.create_buffer(&BufferDesc {
            size: block_capacity * 4,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TILED,
            residency: Residency::Device,
        })?;

        log::info!(
            "texel memory installed: {} blocks ({} texels)",
            block_capacity,
            texel_capacity
        );

        Ok(Self {
            buffer,
            block_capacity,
            texel_capacity,
            inner: Mutex::new(TexelMemoryInner { buddy, residency }),
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn texel_capacity(&self) -> u64 {
        self.texel_capacity
    }

    /// Allocate a region for a resource.
    ///
    /// # Errors
    ///
    /// Exhaustion is the fatal path: a diagnostic is surfaced (once per
    /// process) and [`ResourceError::Exhausted`] returned. A bogus region
    /// is never handed back.
    pub fn allocate(&self, info: &ResourceInfo) -> Result<TexelMemoryAllocation> {
        let address_info = compute_address_info(info);

        let texel_block_count = cast_block_count((address_info.texel_count + 31) / 32)?;
        let header_dword_count = TexelMemoryField::SubresourceOffsetStart as u32
            + address_info.subresource_offsets.len() as u32;

        // +1 safety dword absorbing region-write rounding.
        let allocation_dwords = u64::from(header_dword_count) + u64::from(texel_block_count) + 1;

        let mut inner = self.inner.lock().unwrap();

        let buddy = inner.buddy.allocate(allocation_dwords);
        if !buddy.is_valid() {
            drop(inner);
            return Err(self.report_exhaustion(allocation_dwords));
        }

        let texel_base_block = buddy.offset as u32;
        if buddy.offset + allocation_dwords >= self.block_capacity {
            inner.buddy.free(&buddy);
            drop(inner);
            return Err(self.report_exhaustion(allocation_dwords));
        }

        inner
            .residency
            .allocate(buddy.offset * 4, allocation_dwords * 4);

        Ok(TexelMemoryAllocation {
            address_info,
            texel_block_count,
            header_dword_count,
            buddy,
            texel_base_block,
        })
    }

    /// Stage the header and clear all data bits to zero. Header dwords are
    /// written before any shader can observe the allocation.
    pub fn initialize(
        &self,
        command_buffer: &mut CommandBuffer,
        allocation: &TexelMemoryAllocation,
        failure_block_code: u32,
    ) {
        let mut header = vec![0u32; allocation.header_dword_count as usize];
        header[TexelMemoryField::SubresourceCount as usize] =
            allocation.address_info.subresource_offsets.len() as u32;
        header[TexelMemoryField::FailureBlock as usize] = failure_block_code;

        debug_assert!(allocation.texel_block_count > 0, "empty allocation");
        header[TexelMemoryField::TexelCount as usize] = allocation.texel_block_count * 32;

        let offset_start = TexelMemoryField::SubresourceOffsetStart as usize;
        for (index, offset) in allocation.address_info.subresource_offsets.iter().enumerate() {
            header[offset_start + index] = *offset as u32;
        }

        let mut header_bytes = Vec::with_capacity(header.len() * 4);
        for dword in &header {
            header_bytes.extend_from_slice(&dword.to_le_bytes());
        }

        command_buffer.stage_buffer(
            &self.buffer,
            u64::from(allocation.texel_base_block) * 4,
            header_bytes,
        );

        command_buffer.fill_buffer(
            &self.buffer,
            u64::from(allocation.data_base_dword()) * 4,
            u64::from(allocation.texel_block_count) * 4,
            0,
        );
    }

    /// Rewrite the failure-block code of a live allocation.
    pub fn stage_failure_code(
        &self,
        command_buffer: &mut CommandBuffer,
        allocation: &TexelMemoryAllocation,
        failure_block_code: u32,
    ) {
        command_buffer.stage_buffer(
            &self.buffer,
            (u64::from(allocation.texel_base_block) + TexelMemoryField::FailureBlock as u64) * 4,
            failure_block_code.to_le_bytes().to_vec(),
        );
    }

    /// Map any tiles newly covered by live allocations. The null backend
    /// backs the whole buffer, so draining the requests is the whole job;
    /// real backends hand them to the scheduler.
    pub fn update_residency(&self) {
        let requests = self.inner.lock().unwrap().residency.drain_requests();
        if !requests.is_empty() {
            log::debug!("mapping {} texel memory tile ranges", requests.len());
        }
    }

    /// Free a region. Tiles are kept resident for reuse.
    pub fn free(&self, allocation: &TexelMemoryAllocation) {
        self.inner.lock().unwrap().buddy.free(&allocation.buddy);
    }

    fn report_exhaustion(&self, requested: u64) -> ResourceError {
        report_fatal_exhaustion(
            "Texel Memory Exhaustion",
            &format!(
                "the internal texel memory address range of {} blocks ({} unique texels) is \
                 exhausted; texel addressing is limited by hardware addressing constraints. \
                 Disable texel addressing or reduce the tracked workload.",
                self.block_capacity, self.texel_capacity
            ),
        );

        ResourceError::Exhausted {
            what: "texel memory",
            requested,
            capacity: self.block_capacity,
        }
    }
}

fn cast_block_count(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| ResourceError::Exhausted {
        what: "texel memory",
        requested: value,
        capacity: u64::from(u32::MAX),
    })
}

fn prev_power_of_two(value: u64) -> u64 {
    debug_assert!(value > 0);
    1u64 << (63 - value.leading_zeros())
}
