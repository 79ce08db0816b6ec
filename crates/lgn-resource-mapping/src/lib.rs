//! GPU-resident side tables: the physical resource mapping table that lets
//! instrumented shaders turn descriptor indices into stable resource
//! tokens, and the texel memory allocator that assigns every addressable
//! texel a bit in one global tracking buffer.

mod aligned_subresource;
mod buddy_allocator;
mod diagnostic;
mod partitioned_allocator;
mod prmt;
mod texel_memory;
mod token;

pub use aligned_subresource::{
    compute_address_info, texel_offset, AddressInfo, ResourceDimension, ResourceInfo,
};
pub use buddy_allocator::{BuddyAllocation, BuddyAllocator, INVALID_BUDDY_ALLOCATION};
pub use diagnostic::{fatal_exhaustion_count, report_fatal_exhaustion};
pub use partitioned_allocator::{PartitionedAllocator, INVALID_PARTITION_BLOCK};
pub use prmt::{
    PhysicalResourceMappingTable, PhysicalResourceSegmentId, PrmtQueueState, SegmentView,
};
pub use texel_memory::{TexelMemoryAllocation, TexelMemoryAllocator, TexelMemoryField};
pub use token::{ResourceToken, ResourceTypeTag, VirtualResourceMapping, PUID_INVALID};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResourceError {
    /// The only fatal path: the side table cannot grow past the hardware
    /// limit. Surfaced to the user with remediation, never silently mapped.
    #[error("{what} exhausted: {requested} requested over a capacity of {capacity}")]
    Exhausted {
        what: &'static str,
        requested: u64,
        capacity: u64,
    },
    #[error(transparent)]
    Gpu(#[from] lgn_gpu_api::GpuError),
}

pub type Result<T, E = ResourceError> = std::result::Result<T, E>;
