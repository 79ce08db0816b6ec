use bitflags::bitflags;

use crate::ShaderModuleHandle;

bitflags! {
    pub struct BufferUsage: u32 {
        const STORAGE = 1 << 0;
        const CONSTANT = 1 << 1;
        const TRANSFER_SRC = 1 << 2;
        const TRANSFER_DST = 1 << 3;
        /// Sparse tile-mapped residency; only the mapped tiles are backed.
        const TILED = 1 << 4;
    }
}

/// Memory domain of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Device,
    Host,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub residency: Residency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

/// Descriptor heap types the backend exposes; one PRMT exists per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    ResourceView,
    Sampler,
}

/// Pipeline variants tracked by the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    Graphics,
    Compute,
    Library,
}

impl PipelineType {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Library => 2,
        }
    }
}

/// Device limits the layer sizes its side tables against.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityTable {
    /// Maximum element count of a structured buffer view.
    pub buffer_max_element_count: u64,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            buffer_max_element_count: 1 << 27,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub shader: ShaderModuleHandle,
    pub debug_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub shaders: Vec<ShaderModuleHandle>,
    pub debug_name: Option<String>,
}
