use std::sync::Arc;

use crate::{
    BufferDesc, CapabilityTable, CommandBuffer, ComputePipelineDesc, GpuResult,
    GraphicsPipelineDesc, QueueType,
};

/// Opaque driver shader object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderModuleHandle {
    pub id: u64,
}

/// Opaque driver pipeline object. Equal handles refer to the same driver
/// compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    pub id: u64,
}

/// Backend buffer contract. Host access is only valid for host-resident
/// allocations; device-resident buffers reject it outside the null backend.
pub trait BufferApi: Send + Sync {
    fn size(&self) -> u64;

    /// Write bytes from the host.
    ///
    /// # Errors
    ///
    /// Out-of-range accesses fail with [`crate::GpuError::OutOfBounds`].
    fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Read bytes back to the host.
    ///
    /// # Errors
    ///
    /// Out-of-range accesses fail with [`crate::GpuError::OutOfBounds`].
    fn read(&self, offset: u64, out: &mut [u8]) -> GpuResult<()>;
}

#[derive(Clone)]
pub struct Buffer {
    api: Arc<dyn BufferApi>,
}

impl Buffer {
    pub fn new(api: Arc<dyn BufferApi>) -> Self {
        Self { api }
    }

    pub fn size(&self) -> u64 {
        self.api.size()
    }

    /// # Errors
    ///
    /// See [`BufferApi::write`].
    pub fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.api.write(offset, data)
    }

    /// # Errors
    ///
    /// See [`BufferApi::read`].
    pub fn read(&self, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        self.api.read(offset, out)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("size", &self.size()).finish()
    }
}

/// A matched host/device buffer pair sharing one layout.
#[derive(Debug, Clone)]
pub struct MirrorAllocation {
    pub host: Buffer,
    pub device: Buffer,
}

/// Timeline fence contract: monotonically increasing completed value.
/// `signal` is the backend-facing half, invoked when a submission retires.
pub trait FenceApi: Send + Sync {
    fn completed_value(&self) -> u64;

    fn signal(&self, value: u64);
}

#[derive(Clone)]
pub struct Fence {
    api: Arc<dyn FenceApi>,
}

impl Fence {
    pub fn new(api: Arc<dyn FenceApi>) -> Self {
        Self { api }
    }

    pub fn completed_value(&self) -> u64 {
        self.api.completed_value()
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.api.completed_value() >= value
    }

    /// Backend-facing: mark the fence as reaching `value`.
    pub fn signal(&self, value: u64) {
        self.api.signal(value);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("completed", &self.completed_value())
            .finish()
    }
}

/// Backend queue contract. Submissions on one queue complete in order.
pub trait QueueApi: Send + Sync {
    /// Submit recorded command buffers, optionally signaling `fence` to
    /// `value` on completion.
    ///
    /// # Errors
    ///
    /// Backend-specific; the null backend only fails on malformed commands.
    fn submit(
        &self,
        command_buffers: &[CommandBuffer],
        signal: Option<(&Fence, u64)>,
    ) -> GpuResult<()>;
}

#[derive(Clone)]
pub struct Queue {
    api: Arc<dyn QueueApi>,
    queue_type: QueueType,
}

impl Queue {
    pub fn new(api: Arc<dyn QueueApi>, queue_type: QueueType) -> Self {
        Self { api, queue_type }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// # Errors
    ///
    /// See [`QueueApi::submit`].
    pub fn submit(
        &self,
        command_buffers: &[CommandBuffer],
        signal: Option<(&Fence, u64)>,
    ) -> GpuResult<()> {
        self.api.submit(command_buffers, signal)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("queue_type", &self.queue_type)
            .finish()
    }
}

/// Backend device contract.
pub trait DeviceApi: Send + Sync {
    /// # Errors
    ///
    /// Fails with [`crate::GpuError::OutOfMemory`] on exhaustion.
    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer>;

    /// Create a host/device mirror pair for `desc`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::GpuError::OutOfMemory`] on exhaustion.
    fn create_mirror_allocation(&self, desc: &BufferDesc) -> GpuResult<MirrorAllocation>;

    /// # Errors
    ///
    /// Backend-specific.
    fn create_fence(&self) -> GpuResult<Fence>;

    /// # Errors
    ///
    /// Fails when the backend rejects the byte code.
    fn create_shader_module(&self, code: &[u8]) -> GpuResult<ShaderModuleHandle>;

    /// # Errors
    ///
    /// Fails when the backend rejects the pipeline description.
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> GpuResult<PipelineHandle>;

    /// # Errors
    ///
    /// Fails when the backend rejects the pipeline description.
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> GpuResult<PipelineHandle>;

    fn queue(&self, queue_type: QueueType) -> Queue;

    fn capability_table(&self) -> CapabilityTable;
}

/// Shared handle to a backend device.
#[derive(Clone)]
pub struct DeviceContext {
    api: Arc<dyn DeviceApi>,
}

impl DeviceContext {
    pub fn new(api: Arc<dyn DeviceApi>) -> Self {
        Self { api }
    }

    pub fn create_command_buffer(&self) -> CommandBuffer {
        CommandBuffer::new()
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_buffer`].
    pub fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer> {
        self.api.create_buffer(desc)
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_mirror_allocation`].
    pub fn create_mirror_allocation(&self, desc: &BufferDesc) -> GpuResult<MirrorAllocation> {
        self.api.create_mirror_allocation(desc)
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_fence`].
    pub fn create_fence(&self) -> GpuResult<Fence> {
        self.api.create_fence()
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_shader_module`].
    pub fn create_shader_module(&self, code: &[u8]) -> GpuResult<ShaderModuleHandle> {
        self.api.create_shader_module(code)
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_compute_pipeline`].
    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> GpuResult<PipelineHandle> {
        self.api.create_compute_pipeline(desc)
    }

    /// # Errors
    ///
    /// See [`DeviceApi::create_graphics_pipeline`].
    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> GpuResult<PipelineHandle> {
        self.api.create_graphics_pipeline(desc)
    }

    pub fn queue(&self, queue_type: QueueType) -> Queue {
        self.api.queue(queue_type)
    }

    pub fn capability_table(&self) -> CapabilityTable {
        self.api.capability_table()
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext").finish()
    }
}
