//! Host-memory backend with immediate submission semantics.
//!
//! Buffers are byte slabs, submissions execute synchronously on the
//! calling thread, and fences complete as soon as the submit returns.
//! Dispatch hooks stand in for shader execution: a test registers a
//! closure against a pipeline and the backend runs it at dispatch, which
//! is how GPU-side writes are modeled end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    Buffer, BufferApi, BufferDesc, CapabilityTable, Command, CommandBuffer, ComputePipelineDesc,
    DeviceApi, DeviceContext, Fence, FenceApi, GpuError, GpuResult, GraphicsPipelineDesc,
    MirrorAllocation, PipelineHandle, Queue, QueueApi, QueueType, ShaderModuleHandle,
};

/// Closure invoked for every dispatch recorded against a pipeline.
pub type DispatchHook = Box<dyn Fn([u32; 3]) + Send + Sync>;

#[derive(Default)]
struct NullShared {
    next_id: AtomicU64,
    compile_count: AtomicU64,
    shader_modules: Mutex<HashMap<u64, Vec<u8>>>,
    dispatch_hooks: Mutex<HashMap<u64, DispatchHook>>,
    capabilities: Mutex<CapabilityTable>,
}

impl NullShared {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The null device. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct NullDevice {
    shared: Arc<NullShared>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: CapabilityTable) -> Self {
        let device = Self::new();
        *device.shared.capabilities.lock().unwrap() = capabilities;
        device
    }

    /// Device context sharing this backend's state.
    pub fn context(&self) -> DeviceContext {
        DeviceContext::new(Arc::new(self.clone()))
    }

    /// Number of driver pipeline compiles performed so far.
    pub fn created_pipeline_count(&self) -> u64 {
        self.shared.compile_count.load(Ordering::Relaxed)
    }

    /// Byte code handed to the driver for a shader module.
    pub fn shader_code(&self, handle: ShaderModuleHandle) -> Option<Vec<u8>> {
        self.shared
            .shader_modules
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
    }

    /// Install a dispatch hook for a pipeline, standing in for the shader.
    pub fn set_dispatch_hook(&self, pipeline: PipelineHandle, hook: DispatchHook) {
        self.shared
            .dispatch_hooks
            .lock()
            .unwrap()
            .insert(pipeline.id, hook);
    }
}

impl DeviceApi for NullDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer> {
        Ok(Buffer::new(Arc::new(NullBuffer {
            bytes: Mutex::new(vec![0u8; desc.size as usize]),
        })))
    }

    fn create_mirror_allocation(&self, desc: &BufferDesc) -> GpuResult<MirrorAllocation> {
        Ok(MirrorAllocation {
            host: self.create_buffer(desc)?,
            device: self.create_buffer(desc)?,
        })
    }

    fn create_fence(&self) -> GpuResult<Fence> {
        Ok(Fence::new(Arc::new(NullFence {
            value: AtomicU64::new(0),
        })))
    }

    fn create_shader_module(&self, code: &[u8]) -> GpuResult<ShaderModuleHandle> {
        if code.is_empty() {
            return Err(GpuError::InvalidOperation(
                "empty shader byte code".to_string(),
            ));
        }

        let id = self.shared.allocate_id();
        self.shared
            .shader_modules
            .lock()
            .unwrap()
            .insert(id, code.to_vec());
        Ok(ShaderModuleHandle { id })
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> GpuResult<PipelineHandle> {
        if !self
            .shared
            .shader_modules
            .lock()
            .unwrap()
            .contains_key(&desc.shader.id)
        {
            return Err(GpuError::InvalidOperation(
                "compute pipeline references an unknown shader".to_string(),
            ));
        }

        self.shared.compile_count.fetch_add(1, Ordering::Relaxed);
        Ok(PipelineHandle {
            id: self.shared.allocate_id(),
        })
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> GpuResult<PipelineHandle> {
        let modules = self.shared.shader_modules.lock().unwrap();
        for shader in &desc.shaders {
            if !modules.contains_key(&shader.id) {
                return Err(GpuError::InvalidOperation(
                    "graphics pipeline references an unknown shader".to_string(),
                ));
            }
        }
        drop(modules);

        self.shared.compile_count.fetch_add(1, Ordering::Relaxed);
        Ok(PipelineHandle {
            id: self.shared.allocate_id(),
        })
    }

    fn queue(&self, queue_type: QueueType) -> Queue {
        Queue::new(
            Arc::new(NullQueue {
                shared: Arc::clone(&self.shared),
            }),
            queue_type,
        )
    }

    fn capability_table(&self) -> CapabilityTable {
        *self.shared.capabilities.lock().unwrap()
    }
}

struct NullBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl NullBuffer {
    fn check_range(&self, offset: u64, size: u64) -> GpuResult<()> {
        let capacity = self.bytes.lock().unwrap().len() as u64;
        if offset + size > capacity {
            return Err(GpuError::OutOfBounds {
                offset,
                size,
                capacity,
            });
        }
        Ok(())
    }
}

impl BufferApi for NullBuffer {
    fn size(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }

    fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        self.check_range(offset, out.len() as u64)?;
        let bytes = self.bytes.lock().unwrap();
        out.copy_from_slice(&bytes[offset as usize..offset as usize + out.len()]);
        Ok(())
    }
}

struct NullFence {
    value: AtomicU64,
}

impl FenceApi for NullFence {
    fn completed_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn signal(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }
}

struct NullQueue {
    shared: Arc<NullShared>,
}

impl QueueApi for NullQueue {
    fn submit(
        &self,
        command_buffers: &[CommandBuffer],
        signal: Option<(&Fence, u64)>,
    ) -> GpuResult<()> {
        let mut bound_pipeline = None;

        for command_buffer in command_buffers {
            for command in command_buffer.commands() {
                self.execute(command, &mut bound_pipeline)?;
            }
        }

        if let Some((fence, value)) = signal {
            log::trace!("null queue retiring submission at fence value {}", value);
            fence.signal(value);
        }

        Ok(())
    }
}

impl NullQueue {
    fn execute(&self, command: &Command, bound_pipeline: &mut Option<u64>) -> GpuResult<()> {
        match command {
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let mut staging = vec![0u8; *size as usize];
                src.read(*src_offset, &mut staging)?;
                dst.write(*dst_offset, &staging)
            }
            Command::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => {
                let mut staging = vec![0u8; *size as usize];
                for chunk in staging.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&value.to_le_bytes());
                }
                dst.write(*offset, &staging)
            }
            Command::StageBuffer { dst, offset, data } => dst.write(*offset, data),
            Command::MemoryBarrier => Ok(()),
            Command::BindPipeline { pipeline } => {
                *bound_pipeline = Some(pipeline.id);
                Ok(())
            }
            Command::Dispatch { groups } => {
                // Dispatch hooks stand in for shader execution.
                if let Some(pipeline) = bound_pipeline {
                    if let Some(hook) = self.shared.dispatch_hooks.lock().unwrap().get(pipeline) {
                        hook(*groups);
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferUsage;
    use crate::Residency;

    fn buffer_desc(size: u64) -> BufferDesc {
        BufferDesc {
            size,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            residency: Residency::Host,
        }
    }

    #[test]
    fn test_submit_executes_and_signals() {
        let device = NullDevice::new();
        let context = device.context();

        let src = context.create_buffer(&buffer_desc(16)).unwrap();
        let dst = context.create_buffer(&buffer_desc(16)).unwrap();
        src.write(0, &[7u8; 16]).unwrap();

        let mut command_buffer = context.create_command_buffer();
        command_buffer.copy_buffer(&src, &dst, 0, 0, 16);

        let fence = context.create_fence().unwrap();
        let queue = context.queue(QueueType::Graphics);
        queue
            .submit(std::slice::from_ref(&command_buffer), Some((&fence, 3)))
            .unwrap();

        assert!(fence.is_complete(3));
        let mut out = [0u8; 16];
        dst.read(0, &mut out).unwrap();
        assert_eq!(out, [7u8; 16]);
    }

    #[test]
    fn test_dispatch_invokes_hook_for_bound_pipeline() {
        let device = NullDevice::new();
        let context = device.context();

        let shader = context.create_shader_module(&[1, 2, 3]).unwrap();
        let pipeline = context
            .create_compute_pipeline(&ComputePipelineDesc {
                shader,
                debug_name: None,
            })
            .unwrap();

        let target = context.create_buffer(&buffer_desc(4)).unwrap();
        let hooked = target.clone();
        device.set_dispatch_hook(
            pipeline,
            Box::new(move |groups| {
                hooked.write(0, &groups[0].to_le_bytes()).unwrap();
            }),
        );

        let mut command_buffer = context.create_command_buffer();
        command_buffer.bind_pipeline(pipeline);
        command_buffer.dispatch([9, 1, 1]);

        context
            .queue(QueueType::Compute)
            .submit(std::slice::from_ref(&command_buffer), None)
            .unwrap();

        let mut out = [0u8; 4];
        target.read(0, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 9);
    }

    #[test]
    fn test_out_of_bounds_read_fails() {
        let device = NullDevice::new();
        let buffer = device.context().create_buffer(&buffer_desc(4)).unwrap();
        let mut out = [0u8; 8];
        assert!(matches!(
            buffer.read(0, &mut out),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_pipeline_compiles_are_counted() {
        let device = NullDevice::new();
        let context = device.context();
        let shader = context.create_shader_module(&[1]).unwrap();

        for _ in 0..3 {
            context
                .create_compute_pipeline(&ComputePipelineDesc {
                    shader,
                    debug_name: None,
                })
                .unwrap();
        }

        assert_eq!(device.created_pipeline_count(), 3);
    }
}
