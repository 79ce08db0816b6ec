use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lgn_dxbc::RootRegisterBindingInfo;
use lgn_gpu_api::{
    CommandBuffer, ComputePipelineDesc, DescriptorHeapType, DeviceContext, PipelineHandle,
    QueueType, ShaderModuleHandle,
};
use lgn_instrumentation::{
    InstrumentationController, LayerInstrumenter, PipelineState, ResourceVersionInfo,
    ShaderSguidHost, ShaderState, UnstableExportFeature, VersioningController,
};
use lgn_resource_mapping::{
    PhysicalResourceMappingTable, PhysicalResourceSegmentId, ResourceError,
    TexelMemoryAllocator, VirtualResourceMapping,
};
use lgn_shader_compiler::{
    PipelineCompiler, PipelineDesc, ShaderCache, ShaderCompiler, ShaderSource,
};
use lgn_shader_export::{
    AllocationMode, ExportError, QueueState, ShaderExportHost, ShaderExportStreamer, StreamState,
};
use lgn_validation_bridge::MemoryBridge;
use lgn_validation_config::{AllocationModeConfig, LayerConfig};
use thiserror::Error;

use crate::{ResourceDesc, ResourceState, Result};

#[derive(Error, Debug)]
pub enum LayerError {
    #[error(transparent)]
    Gpu(#[from] lgn_gpu_api::GpuError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("unknown resource {0}")]
    UnknownResource(u32),
    #[error("unknown shader {0:#x}")]
    UnknownShader(u64),
}

/// The per-device layer state.
pub struct LayerContext {
    device: DeviceContext,
    bridge: Arc<MemoryBridge>,

    resource_table: Arc<PhysicalResourceMappingTable>,
    sampler_table: Arc<PhysicalResourceMappingTable>,
    texel_allocator: Arc<TexelMemoryAllocator>,

    export_host: Arc<ShaderExportHost>,
    streamer: Arc<ShaderExportStreamer>,

    cache: Arc<ShaderCache>,
    controller: Arc<InstrumentationController>,
    versioning: Arc<VersioningController>,
    sguid_host: Arc<ShaderSguidHost>,
    unstable_export: Arc<UnstableExportFeature>,

    puid_allocator: AtomicU32,
    guid_allocator: AtomicU64,
    resources: Mutex<HashMap<u32, ResourceState>>,
    shaders: Mutex<HashMap<u64, Arc<ShaderState>>>,
}

impl LayerContext {
    /// Wire the layer against a device.
    ///
    /// # Errors
    ///
    /// Fails when the side tables cannot be installed.
    pub fn new(device: DeviceContext, config: &LayerConfig) -> Result<Arc<Self>> {
        let bridge = Arc::new(MemoryBridge::new());

        let resource_table = Arc::new(PhysicalResourceMappingTable::new(
            device.clone(),
            DescriptorHeapType::ResourceView,
        )?);
        let sampler_table = Arc::new(PhysicalResourceMappingTable::new(
            device.clone(),
            DescriptorHeapType::Sampler,
        )?);

        let texel_allocator = Arc::new(TexelMemoryAllocator::install(
            &device,
            config.texel_capacity,
        )?);

        let export_host = Arc::new(ShaderExportHost::new());
        let sguid_host = ShaderSguidHost::new();
        let unstable_export = Arc::new(UnstableExportFeature::install(
            &export_host,
            Arc::clone(&sguid_host),
        ));

        let mode = match config.allocation_mode {
            AllocationModeConfig::LocalCommandBuffer => AllocationMode::LocalCommandBuffer {
                max_live_segments: config.max_live_segments,
            },
            AllocationModeConfig::GlobalCyclicBufferNoOverwrite => {
                AllocationMode::GlobalCyclicBufferNoOverwrite
            }
        };

        let streamer = Arc::new(ShaderExportStreamer::new(
            device.clone(),
            Arc::clone(&export_host),
            Arc::clone(&bridge),
            vec![Arc::clone(&resource_table), Arc::clone(&sampler_table)],
            mode,
        ));

        let cache = Arc::new(ShaderCache::new());
        if let Some(path) = &config.cache_path {
            if let Err(error) = cache.deserialize(path) {
                log::warn!("shader cache load failed: {}", error);
            }
            cache.set_auto_serialization(
                path,
                config.cache_flush_threshold,
                config.cache_growth_factor,
            );
        }

        let shader_compiler = Arc::new(ShaderCompiler::new(
            device.clone(),
            Arc::clone(&cache),
            config.shader_worker_count,
        ));
        let pipeline_compiler = Arc::new(PipelineCompiler::new(
            device.clone(),
            config.pipeline_worker_count,
        ));

        let instrumenter = Arc::new(LayerInstrumenter::new(
            Arc::clone(&unstable_export),
            default_binding_info(),
        ));

        let table_commit = {
            let resource_table = Arc::clone(&resource_table);
            let sampler_table = Arc::clone(&sampler_table);
            Box::new(move || {
                // Stage-three rebuild of the descriptor mirrors: entries
                // are already host-committed, so bumping nothing here is
                // correct for the null backend; real backends re-create
                // their descriptor views at this point.
                let _ = (&resource_table, &sampler_table);
            }) as Box<dyn Fn() + Send + Sync>
        };

        let controller = InstrumentationController::new(
            Arc::clone(&bridge),
            shader_compiler,
            pipeline_compiler,
            instrumenter,
            table_commit,
        );
        controller.install(&bridge);
        controller.set_synchronous_recording(config.synchronous_recording);

        let versioning = Arc::new(VersioningController::new(Arc::clone(&bridge)));

        Ok(Arc::new(Self {
            device,
            bridge,
            resource_table,
            sampler_table,
            texel_allocator,
            export_host,
            streamer,
            cache,
            controller,
            versioning,
            sguid_host,
            unstable_export,
            puid_allocator: AtomicU32::new(1),
            guid_allocator: AtomicU64::new(1),
            resources: Mutex::new(HashMap::new()),
            shaders: Mutex::new(HashMap::new()),
        }))
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn bridge(&self) -> &Arc<MemoryBridge> {
        &self.bridge
    }

    pub fn controller(&self) -> &Arc<InstrumentationController> {
        &self.controller
    }

    pub fn streamer(&self) -> &Arc<ShaderExportStreamer> {
        &self.streamer
    }

    pub fn export_host(&self) -> &Arc<ShaderExportHost> {
        &self.export_host
    }

    pub fn resource_table(&self) -> &Arc<PhysicalResourceMappingTable> {
        &self.resource_table
    }

    pub fn sampler_table(&self) -> &Arc<PhysicalResourceMappingTable> {
        &self.sampler_table
    }

    pub fn texel_allocator(&self) -> &Arc<TexelMemoryAllocator> {
        &self.texel_allocator
    }

    pub fn versioning(&self) -> &Arc<VersioningController> {
        &self.versioning
    }

    pub fn sguid_host(&self) -> &Arc<ShaderSguidHost> {
        &self.sguid_host
    }

    pub fn unstable_export(&self) -> &Arc<UnstableExportFeature> {
        &self.unstable_export
    }

    pub fn shader_cache(&self) -> &Arc<ShaderCache> {
        &self.cache
    }

    /// Create and track a resource: assign its puid, give it a texel
    /// region, and narrate it to the inspector.
    ///
    /// # Errors
    ///
    /// Texel exhaustion is fatal; see [`ResourceError::Exhausted`].
    pub fn create_resource(&self, desc: ResourceDesc) -> Result<u32> {
        let puid = self.puid_allocator.fetch_add(1, Ordering::Relaxed);

        let texel_allocation = self.texel_allocator.allocate(&desc.info)?;

        // Header dwords land before any shader can observe the region.
        let mut command_buffer = self.device.create_command_buffer();
        self.texel_allocator
            .initialize(&mut command_buffer, &texel_allocation, puid);
        self.device
            .queue(QueueType::Graphics)
            .submit(std::slice::from_ref(&command_buffer), None)?;
        self.texel_allocator.update_residency();

        self.versioning.create_or_recommit(&ResourceVersionInfo {
            puid,
            name: desc.name.clone(),
            width: desc.info.width,
            height: desc.info.height,
            depth: desc.info.depth_or_slice_count,
            format: desc.format.clone(),
        });

        self.resources.lock().unwrap().insert(
            puid,
            ResourceState {
                puid,
                desc,
                texel_allocation: Some(texel_allocation),
                bindings: Vec::new(),
            },
        );

        Ok(puid)
    }

    /// Destroy a resource: every descriptor slot referencing it is
    /// invalidated before the slot can be reused, then the texel region is
    /// released.
    ///
    /// # Errors
    ///
    /// Fails on an unknown puid.
    pub fn destroy_resource(&self, puid: u32) -> Result<()> {
        let state = self
            .resources
            .lock()
            .unwrap()
            .remove(&puid)
            .ok_or(LayerError::UnknownResource(puid))?;

        for (segment, offset) in &state.bindings {
            self.resource_table
                .write_mapping(*segment, *offset, &VirtualResourceMapping::invalid());
        }

        if let Some(allocation) = &state.texel_allocation {
            self.texel_allocator.free(allocation);
        }

        self.versioning.destroy(puid);
        Ok(())
    }

    /// Allocate a descriptor segment of the resource-view table.
    ///
    /// # Errors
    ///
    /// Table exhaustion is fatal; see [`ResourceError::Exhausted`].
    pub fn allocate_descriptor_segment(&self, count: u32) -> Result<PhysicalResourceSegmentId> {
        Ok(self.resource_table.allocate(count)?)
    }

    /// Point a descriptor slot at a resource.
    ///
    /// # Errors
    ///
    /// Fails on an unknown puid.
    pub fn write_descriptor(
        &self,
        segment: PhysicalResourceSegmentId,
        offset: u32,
        puid: u32,
    ) -> Result<()> {
        let mut resources = self.resources.lock().unwrap();
        let state = resources
            .get_mut(&puid)
            .ok_or(LayerError::UnknownResource(puid))?;

        self.resource_table
            .write_mapping_with_state(segment, offset, u64::from(puid), &state.mapping());
        state.bindings.push((segment, offset));
        Ok(())
    }

    /// Texel region of a live resource, for inspection.
    pub fn texel_allocation(&self, puid: u32) -> Option<lgn_resource_mapping::TexelMemoryAllocation> {
        self.resources
            .lock()
            .unwrap()
            .get(&puid)
            .and_then(|state| state.texel_allocation.clone())
    }

    /// Tracked shader state, for inspection.
    pub fn shader_state(&self, shader_guid: u64) -> Option<Arc<ShaderState>> {
        self.shaders.lock().unwrap().get(&shader_guid).cloned()
    }

    /// Track a shader module the application created.
    ///
    /// # Errors
    ///
    /// Fails when the driver rejects the byte code.
    pub fn register_shader(&self, source: ShaderSource) -> Result<(u64, ShaderModuleHandle)> {
        let shader_guid = self.guid_allocator.fetch_add(1, Ordering::Relaxed);
        let original = self.device.create_shader_module(source.bytes())?;

        let state = Arc::new(ShaderState::new(shader_guid, source, original));
        self.controller.register_shader(Arc::clone(&state));
        self.shaders.lock().unwrap().insert(shader_guid, state);

        Ok((shader_guid, original))
    }

    /// Track a compute pipeline the application created. The creation
    /// description is deep-copied so the driver's copy may be dropped.
    ///
    /// # Errors
    ///
    /// Fails when the driver rejects the pipeline or the shader is
    /// unknown.
    pub fn register_compute_pipeline(
        &self,
        shader_guid: u64,
        debug_name: Option<&str>,
    ) -> Result<Arc<PipelineState>> {
        let shader = self
            .shaders
            .lock()
            .unwrap()
            .get(&shader_guid)
            .cloned()
            .ok_or(LayerError::UnknownShader(shader_guid))?;

        let desc = ComputePipelineDesc {
            shader: shader.original(),
            debug_name: debug_name.map(str::to_string),
        };
        let original = self.device.create_compute_pipeline(&desc)?;

        let uid = self.guid_allocator.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(PipelineState::new(
            uid,
            debug_name.map(str::to_string),
            vec![shader],
            PipelineDesc::Compute(desc),
            original,
            0,
        ));

        self.controller.register_pipeline(Arc::clone(&state));
        Ok(state)
    }

    /// Per-queue streamer state.
    ///
    /// # Errors
    ///
    /// Propagates fence creation failures.
    pub fn allocate_queue_state(&self, queue_type: QueueType) -> Result<Arc<QueueState>> {
        Ok(self
            .streamer
            .allocate_queue_state(self.device.queue(queue_type))?)
    }

    /// Begin recording: blocks in synchronous-recording mode until any
    /// in-flight instrumentation batch commits.
    pub fn begin_command_buffer(&self) -> (CommandBuffer, StreamState) {
        self.controller.conditional_wait_for_completion();

        let mut state = self.streamer.allocate_stream_state();
        self.streamer.begin_command_buffer(&mut state);
        (self.device.create_command_buffer(), state)
    }

    /// Bind a tracked pipeline: the recorded object is whichever variant
    /// is live, never an in-flight compile.
    pub fn bind_pipeline(
        &self,
        command_buffer: &mut CommandBuffer,
        state: &mut StreamState,
        pipeline: &PipelineState,
    ) -> PipelineHandle {
        let object = pipeline.bound_object();
        command_buffer.bind_pipeline(object);
        self.streamer
            .bind_pipeline(state, object != pipeline.original());
        object
    }

    /// Submit recorded work wrapped by the layer's patch lists.
    ///
    /// # Errors
    ///
    /// Propagates submission failures.
    pub fn submit(
        &self,
        queue_state: &Arc<QueueState>,
        command_buffers: &[CommandBuffer],
        state: &mut StreamState,
    ) -> Result<()> {
        let point = self.versioning.branch_on_segmentation_point();
        self.streamer.submit(queue_state, command_buffers, state)?;
        self.versioning.collapse_on_fork(point);
        Ok(())
    }

    /// Device sync point: drain retired segments, flush the controllers,
    /// and commit the bridge.
    pub fn sync_point(&self) {
        self.streamer.process_all();
        self.sguid_host.commit(&self.bridge);
        self.versioning.commit();
        self.bridge.commit();
    }
}

fn default_binding_info() -> RootRegisterBindingInfo {
    RootRegisterBindingInfo {
        space: 1000,
        shader_export_base_register: 0,
        shader_export_count: 1,
        resource_prmt_base_register: 1,
        sampler_prmt_base_register: 2,
        shader_data_constant_register: 0,
        descriptor_constant_base_register: 1,
        event_constant_base_register: 2,
        shader_resource_base_register: 3,
        shader_resource_count: 0,
    }
}
