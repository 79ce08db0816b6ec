//! Backend abstraction the validation layer records and submits through.
//!
//! The real graphics APIs live behind per-backend implementations supplied
//! by the host; the in-tree [`backends::null`] backend executes everything
//! in host memory with immediate submission semantics, which is what the
//! workspace tests drive.

pub mod backends;
mod command;
mod device;
mod types;

pub use command::{Command, CommandBuffer};
pub use device::{
    Buffer, BufferApi, DeviceApi, DeviceContext, Fence, FenceApi, MirrorAllocation,
    PipelineHandle, Queue, QueueApi, ShaderModuleHandle,
};
pub use types::{
    BufferDesc, BufferUsage, CapabilityTable, ComputePipelineDesc, DescriptorHeapType,
    GraphicsPipelineDesc, PipelineType, QueueType, Residency,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("access of {size} bytes at {offset} is out of bounds for a {capacity} byte resource")]
    OutOfBounds {
        offset: u64,
        size: u64,
        capacity: u64,
    },
    #[error("device rejected the operation: {0}")]
    InvalidOperation(String),
    #[error("device is out of memory")]
    OutOfMemory,
}

pub type GpuResult<T, E = GpuError> = std::result::Result<T, E>;
