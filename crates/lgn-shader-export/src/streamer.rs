use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use lgn_gpu_api::{Buffer, CommandBuffer, DeviceContext, Fence, GpuResult, Queue};
use lgn_resource_mapping::{PhysicalResourceMappingTable, PrmtQueueState};
use lgn_validation_bridge::MemoryBridge;
use lgn_validation_messages::{MessageSchema, MessageStream};

use crate::{
    ExportError, ExportTypeInfo, Result, SegmentInfo, ShaderExportHost, StreamAllocator,
};

/// How segment memory is provisioned per submission.
#[derive(Debug, Clone, Copy)]
pub enum AllocationMode {
    /// Fresh (pooled) buffers per submission; counters reset in the
    /// pre-patch list. Allocation spins once `max_live_segments` are in
    /// flight on a queue.
    LocalCommandBuffer { max_live_segments: usize },
    /// One shared buffer reused cyclically. Writers past the capacity
    /// drop; the host clamps reads and reports the overshoot.
    GlobalCyclicBufferNoOverwrite,
}

/// Per-recording stream state. Owned by the recording thread for the
/// duration of one command buffer.
#[derive(Debug, Default)]
pub struct StreamState {
    recording: bool,
    instrumented_bound: bool,
    export_bound: bool,
    prmt_bound: bool,
    constants_bound: bool,
    referenced_heaps: Vec<u64>,
}

/// One submission's segment: the buffers it writes, the fence value that
/// retires it, and everything whose lifetime is pinned to it.
pub struct StreamSegment {
    info: Arc<SegmentInfo>,
    shared: bool,
    fence_value: u64,
    latent_overshoot: u32,
    referenced_heaps: Vec<u64>,
}

impl StreamSegment {
    pub fn latent_overshoot(&self) -> u32 {
        self.latent_overshoot
    }
}

struct QueueInner {
    next_fence_value: u64,
    live: VecDeque<StreamSegment>,
    /// Cyclic mode: records already surfaced per export stream.
    drained_records: Vec<u32>,
    /// Cyclic mode: overshoot already reported per export stream.
    reported_overshoot: Vec<u32>,
}

/// Per-queue streamer state: the submission fence and the FIFO of live
/// segments.
pub struct QueueState {
    queue: Queue,
    fence: Fence,
    prmt_states: Vec<(Arc<PhysicalResourceMappingTable>, Arc<PrmtQueueState>)>,
    inner: Mutex<QueueInner>,
}

impl QueueState {
    pub fn live_segment_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }
}

/// Device-side view of the currently executing segment, standing in for
/// the root bindings an instrumented shader would receive.
#[derive(Clone)]
pub struct ExportBindings {
    streams: Vec<(ExportTypeInfo, Buffer)>,
    counter: Buffer,
}

impl ExportBindings {
    /// Emulate the shader-side export: claim a slot by bumping the
    /// counter, then write the record unless the stream is full.
    ///
    /// # Errors
    ///
    /// Propagates device access failures.
    pub fn write_record(&self, export_id: u32, dwords: &[u32]) -> GpuResult<()> {
        let (type_info, buffer) = &self.streams[export_id as usize];
        debug_assert_eq!(
            dwords.len() as u32,
            type_info.record_dword_count,
            "record arity mismatch"
        );

        // Claim the slot.
        let mut counter_bytes = [0u8; 4];
        self.counter.read(u64::from(export_id) * 4, &mut counter_bytes)?;
        let slot = u32::from_le_bytes(counter_bytes);
        self.counter
            .write(u64::from(export_id) * 4, &(slot + 1).to_le_bytes())?;

        // No overwrite past the capacity; the counter still advances so
        // the host can account for the drop.
        let stride = u64::from(type_info.record_dword_count) * 4;
        let offset = u64::from(slot) * stride;
        if offset + stride > buffer.size() {
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(dwords.len() * 4);
        for dword in dwords {
            bytes.extend_from_slice(&dword.to_le_bytes());
        }
        buffer.write(offset, &bytes)
    }
}

/// The streamer proper.
pub struct ShaderExportStreamer {
    device: DeviceContext,
    allocator: StreamAllocator,
    host: Arc<ShaderExportHost>,
    bridge: Arc<MemoryBridge>,
    tables: Vec<Arc<PhysicalResourceMappingTable>>,
    mode: AllocationMode,
    shared_segment: Mutex<Option<Arc<SegmentInfo>>>,
    executing: Mutex<Option<ExportBindings>>,
    queues: Mutex<Vec<Weak<QueueState>>>,
}

impl ShaderExportStreamer {
    pub fn new(
        device: DeviceContext,
        host: Arc<ShaderExportHost>,
        bridge: Arc<MemoryBridge>,
        tables: Vec<Arc<PhysicalResourceMappingTable>>,
        mode: AllocationMode,
    ) -> Self {
        let allocator = StreamAllocator::new(device.clone(), Arc::clone(&host));
        Self::with_allocator(device, allocator, host, bridge, tables, mode)
    }

    pub fn with_allocator(
        device: DeviceContext,
        allocator: StreamAllocator,
        host: Arc<ShaderExportHost>,
        bridge: Arc<MemoryBridge>,
        tables: Vec<Arc<PhysicalResourceMappingTable>>,
        mode: AllocationMode,
    ) -> Self {
        Self {
            device,
            allocator,
            host,
            bridge,
            tables,
            mode,
            shared_segment: Mutex::new(None),
            executing: Mutex::new(None),
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Allocate streamer state for a queue.
    pub fn allocate_queue_state(&self, queue: Queue) -> GpuResult<Arc<QueueState>> {
        let fence = self.device.create_fence()?;
        let prmt_states = self
            .tables
            .iter()
            .map(|table| (Arc::clone(table), table.register_queue_state()))
            .collect();

        let bound = self.host.bound() as usize;
        let state = Arc::new(QueueState {
            queue,
            fence,
            prmt_states,
            inner: Mutex::new(QueueInner {
                next_fence_value: 0,
                live: VecDeque::new(),
                drained_records: vec![0; bound],
                reported_overshoot: vec![0; bound],
            }),
        });

        self.queues.lock().unwrap().push(Arc::downgrade(&state));
        Ok(state)
    }

    pub fn allocate_stream_state(&self) -> StreamState {
        StreamState::default()
    }

    pub fn begin_command_buffer(&self, state: &mut StreamState) {
        state.recording = true;
        state.instrumented_bound = false;
        state.export_bound = false;
        state.prmt_bound = false;
        state.constants_bound = false;
        state.referenced_heaps.clear();
    }

    pub fn reset_command_buffer(&self, state: &mut StreamState) {
        self.begin_command_buffer(state);
        state.recording = false;
    }

    pub fn end_command_buffer(&self, state: &mut StreamState) {
        state.recording = false;
    }

    /// Invoked at pipeline binding: an instrumented pipeline patch-binds
    /// the export stream, the mapping tables, and the constant data into
    /// the root parameters reserved for the layer.
    pub fn bind_pipeline(&self, state: &mut StreamState, instrumented: bool) {
        state.instrumented_bound = instrumented;
        if instrumented {
            state.export_bound = true;
            state.prmt_bound = true;
            state.constants_bound = true;
        }
    }

    /// Track a descriptor heap referenced by the recording; its lifetime
    /// extends through the segment.
    pub fn reference_descriptor_heap(&self, state: &mut StreamState, heap: u64) {
        if !state.referenced_heaps.contains(&heap) {
            state.referenced_heaps.push(heap);
        }
    }

    /// Draw/dispatch-time validation of the reserved root parameters.
    ///
    /// # Errors
    ///
    /// Fails when an instrumented pipeline is bound with unpatched
    /// parameters.
    pub fn validate_dispatch(&self, state: &StreamState) -> Result<()> {
        if state.instrumented_bound
            && !(state.export_bound && state.prmt_bound && state.constants_bound)
        {
            return Err(ExportError::UnboundStreamState);
        }
        Ok(())
    }

    /// Bindings of the segment currently executing on the device, for
    /// shader-side writers.
    pub fn executing_bindings(&self) -> Option<ExportBindings> {
        self.executing.lock().unwrap().clone()
    }

    /// Submit application command buffers wrapped by the layer's pre and
    /// post patch lists, then tag and enqueue the submission's segment.
    ///
    /// # Errors
    ///
    /// Propagates allocation and submission failures.
    pub fn submit(
        &self,
        queue_state: &Arc<QueueState>,
        command_buffers: &[CommandBuffer],
        state: &mut StreamState,
    ) -> Result<()> {
        // Backpressure: local mode caps in-flight segments per queue.
        if let AllocationMode::LocalCommandBuffer { max_live_segments } = self.mode {
            while queue_state.inner.lock().unwrap().live.len() >= max_live_segments.max(1) {
                self.process(queue_state);
                std::thread::yield_now();
            }
        }

        let (info, shared) = self.segment_for_submission()?;

        let fence_value = {
            let mut inner = queue_state.inner.lock().unwrap();
            inner.next_fence_value += 1;
            inner.next_fence_value
        };

        // Pre patch: refresh the mapping tables and reset the counters.
        let mut pre = self.device.create_command_buffer();
        for (table, prmt_state) in &queue_state.prmt_states {
            table.update(&mut pre, prmt_state);
        }

        let reset_counters = match self.mode {
            AllocationMode::LocalCommandBuffer { .. } => true,
            AllocationMode::GlobalCyclicBufferNoOverwrite => {
                let mut inner = queue_state.inner.lock().unwrap();
                let idle = inner.live.is_empty();
                if idle {
                    inner.drained_records.iter_mut().for_each(|d| *d = 0);
                    inner.reported_overshoot.iter_mut().for_each(|d| *d = 0);
                }
                idle
            }
        };
        if reset_counters {
            let counter_size = info.counter.allocation.device.size();
            pre.fill_buffer(&info.counter.allocation.device, 0, counter_size, 0);
        }

        // Post patch: reserved for post-submission tasks.
        let post = self.device.create_command_buffer();

        queue_state.queue.submit(std::slice::from_ref(&pre), None)?;

        // The application work executes against this segment's bindings.
        *self.executing.lock().unwrap() = Some(bindings_of(&info));
        let submitted = queue_state.queue.submit(command_buffers, None);
        *self.executing.lock().unwrap() = None;
        submitted?;

        queue_state.queue.submit(
            std::slice::from_ref(&post),
            Some((&queue_state.fence, fence_value)),
        )?;

        let segment = StreamSegment {
            info,
            shared,
            fence_value,
            latent_overshoot: 0,
            referenced_heaps: std::mem::take(&mut state.referenced_heaps),
        };
        queue_state.inner.lock().unwrap().live.push_back(segment);

        Ok(())
    }

    /// Queue-scoped sync point: surface every segment whose fence has
    /// retired, strictly FIFO. A later segment never overtakes an earlier
    /// one, even with its fence complete.
    pub fn process(&self, queue_state: &QueueState) {
        loop {
            let segment = {
                let mut inner = queue_state.inner.lock().unwrap();
                match inner.live.front() {
                    Some(segment) if queue_state.fence.is_complete(segment.fence_value) => {
                        inner.live.pop_front().unwrap()
                    }
                    _ => break,
                }
            };

            if let Err(error) = self.process_segment(queue_state, segment) {
                log::error!("failed to process export segment: {}", error);
            }
        }

        self.bridge.commit();
    }

    /// Whole-device sync point.
    pub fn process_all(&self) {
        let queues: Vec<Arc<QueueState>> = self
            .queues
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for queue in queues {
            self.process(&queue);
        }
    }

    fn segment_for_submission(&self) -> Result<(Arc<SegmentInfo>, bool)> {
        match self.mode {
            AllocationMode::LocalCommandBuffer { .. } => {
                Ok((Arc::new(self.allocator.allocate_segment()?), false))
            }
            AllocationMode::GlobalCyclicBufferNoOverwrite => {
                let mut shared = self.shared_segment.lock().unwrap();
                if shared.is_none() {
                    *shared = Some(Arc::new(self.allocator.allocate_segment()?));
                }
                Ok((Arc::clone(shared.as_ref().unwrap()), true))
            }
        }
    }

    fn process_segment(
        &self,
        queue_state: &QueueState,
        mut segment: StreamSegment,
    ) -> Result<()> {
        let info = &segment.info;

        // Counters device to host, then read them back.
        let mut copy = self.device.create_command_buffer();
        let counter_size = info.counter.allocation.device.size();
        copy.copy_buffer(
            &info.counter.allocation.device,
            &info.counter.allocation.host,
            0,
            0,
            counter_size,
        );
        queue_state.queue.submit(std::slice::from_ref(&copy), None)?;

        let mut counter_bytes = vec![0u8; counter_size as usize];
        info.counter.allocation.host.read(0, &mut counter_bytes)?;

        let mut data_copies = self.device.create_command_buffer();
        let mut pending: Vec<(usize, u32, u32)> = Vec::new();

        for (index, stream) in info.streams.iter().enumerate() {
            let counter = u32::from_le_bytes(
                counter_bytes[index * 4..index * 4 + 4].try_into().expect("dword"),
            );
            let capacity = stream.record_capacity();
            let total = counter.min(capacity);

            let (base, count) = if segment.shared {
                let mut inner = queue_state.inner.lock().unwrap();
                let drained = inner.drained_records[index];
                let fresh = total.saturating_sub(drained);
                inner.drained_records[index] = total;

                let overshoot = counter.saturating_sub(capacity);
                let fresh_overshoot =
                    overshoot.saturating_sub(inner.reported_overshoot[index]);
                inner.reported_overshoot[index] = overshoot;
                segment.latent_overshoot += fresh_overshoot;

                (drained, fresh)
            } else {
                segment.latent_overshoot += counter.saturating_sub(capacity);
                (0, total)
            };

            if count == 0 {
                continue;
            }

            let stride = u64::from(stream.type_info.record_dword_count) * 4;
            data_copies.copy_buffer(
                &stream.allocation.device,
                &stream.allocation.host,
                u64::from(base) * stride,
                u64::from(base) * stride,
                u64::from(count) * stride,
            );
            pending.push((index, base, count));
        }

        if !data_copies.is_empty() {
            queue_state
                .queue
                .submit(std::slice::from_ref(&data_copies), None)?;
        }

        for (index, base, count) in pending {
            let stream = &info.streams[index];
            let stride = u64::from(stream.type_info.record_dword_count) * 4;

            let mut data = vec![0u8; (u64::from(count) * stride) as usize];
            stream
                .allocation
                .host
                .read(u64::from(base) * stride, &mut data)?;

            self.bridge.add_stream(MessageStream::from_parts(
                MessageSchema::typed(stream.type_info.message_id),
                0,
                count,
                data,
            ));
        }

        if segment.latent_overshoot > 0 {
            log::warn!(
                "export segment dropped {} records under backpressure",
                segment.latent_overshoot
            );
        }

        // Heap references die with the segment.
        segment.referenced_heaps.clear();

        // Recycle local segments back through the pool.
        if !segment.shared {
            if let Ok(info) = Arc::try_unwrap(segment.info) {
                self.allocator.free_segment(info);
            }
        }

        Ok(())
    }
}

fn bindings_of(info: &SegmentInfo) -> ExportBindings {
    ExportBindings {
        streams: info
            .streams
            .iter()
            .map(|stream| (stream.type_info, stream.allocation.device.clone()))
            .collect(),
        counter: info.counter.allocation.device.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_gpu_api::backends::null::NullDevice;
    use lgn_gpu_api::{ComputePipelineDesc, PipelineHandle, QueueType};
    use lgn_validation_bridge::BridgeListener;
    use lgn_validation_messages::diagnostic::UnstableExportMessage;
    use lgn_validation_messages::Message;

    #[derive(Default)]
    struct Collector {
        sguids: Mutex<Vec<u32>>,
    }

    impl BridgeListener for Collector {
        fn handle(&self, streams: &[MessageStream]) {
            let mut sguids = self.sguids.lock().unwrap();
            for stream in streams {
                for message in stream.decode_all::<UnstableExportMessage>().unwrap() {
                    sguids.push(message.sguid);
                }
            }
        }
    }

    struct Fixture {
        device: NullDevice,
        streamer: Arc<ShaderExportStreamer>,
        queue_state: Arc<QueueState>,
        collector: Arc<Collector>,
        export_id: u32,
    }

    fn fixture(mode: AllocationMode, data_size: u64) -> Fixture {
        let device = NullDevice::new();
        let context = device.context();

        let host = Arc::new(ShaderExportHost::new());
        let export_id = host.allocate(
            UnstableExportMessage::ID,
            UnstableExportMessage::EXPORT_DWORD_COUNT,
        );

        let bridge = Arc::new(MemoryBridge::new());
        let collector = Arc::new(Collector::default());
        bridge.register(UnstableExportMessage::ID, collector.clone());

        let allocator =
            StreamAllocator::with_data_size(context.clone(), Arc::clone(&host), data_size);
        let streamer = Arc::new(ShaderExportStreamer::with_allocator(
            context.clone(),
            allocator,
            host,
            bridge,
            Vec::new(),
            mode,
        ));

        let queue_state = streamer
            .allocate_queue_state(context.queue(QueueType::Compute))
            .unwrap();

        Fixture {
            device,
            streamer,
            queue_state,
            collector,
            export_id,
        }
    }

    /// Create a pipeline whose "shader" exports the given records.
    fn exporting_pipeline(fixture: &Fixture, sguids: Vec<u32>) -> PipelineHandle {
        let context = fixture.device.context();
        let shader = context.create_shader_module(&[0xAB]).unwrap();
        let pipeline = context
            .create_compute_pipeline(&ComputePipelineDesc {
                shader,
                debug_name: None,
            })
            .unwrap();

        let streamer = Arc::clone(&fixture.streamer);
        let export_id = fixture.export_id;
        fixture.device.set_dispatch_hook(
            pipeline,
            Box::new(move |_| {
                let bindings = streamer.executing_bindings().expect("segment bound");
                for sguid in &sguids {
                    bindings
                        .write_record(export_id, &[*sguid, 0, 0, 0])
                        .unwrap();
                }
            }),
        );
        pipeline
    }

    fn submit_dispatch(fixture: &Fixture, pipeline: PipelineHandle) {
        let mut state = fixture.streamer.allocate_stream_state();
        fixture.streamer.begin_command_buffer(&mut state);
        fixture.streamer.bind_pipeline(&mut state, true);
        fixture.streamer.validate_dispatch(&state).unwrap();

        let mut command_buffer = fixture.device.context().create_command_buffer();
        command_buffer.bind_pipeline(pipeline);
        command_buffer.dispatch([1, 1, 1]);

        fixture.streamer.end_command_buffer(&mut state);
        fixture
            .streamer
            .submit(
                &fixture.queue_state,
                std::slice::from_ref(&command_buffer),
                &mut state,
            )
            .unwrap();
    }

    #[test]
    fn test_submissions_surface_in_order() {
        let fixture = fixture(
            AllocationMode::LocalCommandBuffer {
                max_live_segments: 8,
            },
            1024,
        );

        let first = exporting_pipeline(&fixture, vec![1]);
        let second = exporting_pipeline(&fixture, vec![2]);

        submit_dispatch(&fixture, first);
        submit_dispatch(&fixture, second);

        assert_eq!(fixture.queue_state.live_segment_count(), 2);
        fixture.streamer.process_all();

        assert_eq!(*fixture.collector.sguids.lock().unwrap(), vec![1, 2]);
        assert_eq!(fixture.queue_state.live_segment_count(), 0);
    }

    #[test]
    fn test_cyclic_buffer_clamps_and_recovers() {
        // Two records of capacity per stream.
        let capacity_bytes =
            u64::from(UnstableExportMessage::EXPORT_DWORD_COUNT) * 4 * 2;
        let fixture = fixture(
            AllocationMode::GlobalCyclicBufferNoOverwrite,
            capacity_bytes,
        );

        // Three writes against a two-record stream: the third drops.
        let noisy = exporting_pipeline(&fixture, vec![7, 8, 9]);
        submit_dispatch(&fixture, noisy);
        fixture.streamer.process(&fixture.queue_state);

        assert_eq!(*fixture.collector.sguids.lock().unwrap(), vec![7, 8]);

        // The queue went idle, so the next submission resets the counters
        // and the stream recovers.
        let calm = exporting_pipeline(&fixture, vec![5]);
        submit_dispatch(&fixture, calm);
        fixture.streamer.process(&fixture.queue_state);

        assert_eq!(*fixture.collector.sguids.lock().unwrap(), vec![7, 8, 5]);
    }

    #[test]
    fn test_unbound_dispatch_is_flagged() {
        let fixture = fixture(
            AllocationMode::LocalCommandBuffer {
                max_live_segments: 2,
            },
            256,
        );

        let mut state = fixture.streamer.allocate_stream_state();
        fixture.streamer.begin_command_buffer(&mut state);
        state.instrumented_bound = true;
        state.export_bound = false;

        assert!(matches!(
            fixture.streamer.validate_dispatch(&state),
            Err(ExportError::UnboundStreamState)
        ));
    }

    #[test]
    fn test_backpressure_processes_before_allocating() {
        let fixture = fixture(
            AllocationMode::LocalCommandBuffer {
                max_live_segments: 1,
            },
            256,
        );

        let first = exporting_pipeline(&fixture, vec![1]);
        let second = exporting_pipeline(&fixture, vec![2]);

        submit_dispatch(&fixture, first);
        // Hitting the cap drains the completed segment before allocating.
        submit_dispatch(&fixture, second);

        assert!(fixture.queue_state.live_segment_count() <= 1);
        fixture.streamer.process_all();
        assert_eq!(*fixture.collector.sguids.lock().unwrap(), vec![1, 2]);
    }
}
