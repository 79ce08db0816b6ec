//! Shader export streamer.
//!
//! Instrumented shaders write diagnostic records into bounded GPU buffers;
//! the streamer allocates those buffers per submission, waits on the
//! submission fence, and surfaces the records to the bridge strictly FIFO
//! per queue.

mod allocator;
mod host;
mod streamer;

pub use allocator::{CounterInfo, SegmentInfo, StreamAllocator, StreamInfo};
pub use host::{ExportTypeInfo, ShaderExportHost};
pub use streamer::{
    AllocationMode, ExportBindings, ShaderExportStreamer, StreamSegment, StreamState,
    QueueState,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Gpu(#[from] lgn_gpu_api::GpuError),
    #[error("export stream state was not bound before dispatch")]
    UnboundStreamState,
}

pub type Result<T, E = ExportError> = std::result::Result<T, E>;
