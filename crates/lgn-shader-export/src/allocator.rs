use std::sync::{Arc, Mutex};

use lgn_gpu_api::{BufferDesc, BufferUsage, DeviceContext, MirrorAllocation, Residency};

use crate::{ExportTypeInfo, Result, ShaderExportHost};

/// Default data size of one stream buffer.
const BASE_DATA_SIZE: u64 = 64 * 1024;

/// One export stream's buffer within a segment.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub type_info: ExportTypeInfo,
    pub allocation: MirrorAllocation,
    /// Actual byte size of the stream data (not the allocation).
    pub byte_size: u64,
}

impl StreamInfo {
    /// Record capacity of the stream.
    pub fn record_capacity(&self) -> u32 {
        (self.byte_size / (u64::from(self.type_info.record_dword_count) * 4)) as u32
    }
}

/// The per-segment counter batch: one dword per export stream, device
/// written, host read after the fence.
#[derive(Debug, Clone)]
pub struct CounterInfo {
    pub allocation: MirrorAllocation,
}

/// One allocation unit: a stream per export id plus the counter batch.
/// Partitioning across submissions is up to the allocation mode.
pub struct SegmentInfo {
    pub streams: Vec<StreamInfo>,
    pub counter: CounterInfo,
    pub pending_initialization: bool,
}

/// Pools segments; the stream set reaches a stable size after a few
/// submissions and the buffers recycle through here.
pub struct StreamAllocator {
    device: DeviceContext,
    host: Arc<ShaderExportHost>,
    data_size: u64,
    pool: Mutex<Vec<SegmentInfo>>,
}

impl StreamAllocator {
    pub fn new(device: DeviceContext, host: Arc<ShaderExportHost>) -> Self {
        Self::with_data_size(device, host, BASE_DATA_SIZE)
    }

    pub fn with_data_size(
        device: DeviceContext,
        host: Arc<ShaderExportHost>,
        data_size: u64,
    ) -> Self {
        Self {
            device,
            host,
            data_size,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a segment, reusing a pooled one when available.
    ///
    /// # Errors
    ///
    /// Propagates buffer creation failures.
    pub fn allocate_segment(&self) -> Result<SegmentInfo> {
        if let Some(mut segment) = self.pool.lock().unwrap().pop() {
            segment.pending_initialization = true;
            return Ok(segment);
        }

        let exports = self.host.enumerate();

        let mut streams = Vec::with_capacity(exports.len());
        for export in &exports {
            let allocation = self.device.create_mirror_allocation(&BufferDesc {
                size: self.data_size,
                usage: BufferUsage::STORAGE
                    | BufferUsage::TRANSFER_SRC
                    | BufferUsage::TRANSFER_DST,
                residency: Residency::Host,
            })?;

            streams.push(StreamInfo {
                type_info: *export,
                allocation,
                byte_size: self.data_size,
            });
        }

        let counter = CounterInfo {
            allocation: self.device.create_mirror_allocation(&BufferDesc {
                size: (exports.len().max(1) * 4) as u64,
                usage: BufferUsage::STORAGE
                    | BufferUsage::TRANSFER_SRC
                    | BufferUsage::TRANSFER_DST,
                residency: Residency::Host,
            })?,
        };

        log::debug!("allocated export segment with {} streams", streams.len());

        Ok(SegmentInfo {
            streams,
            counter,
            pending_initialization: true,
        })
    }

    /// Return a segment to the pool.
    pub fn free_segment(&self, segment: SegmentInfo) {
        self.pool.lock().unwrap().push(segment);
    }
}
