use lgn_resource_mapping::{
    PhysicalResourceSegmentId, ResourceInfo, ResourceToken, ResourceTypeTag,
    TexelMemoryAllocation, VirtualResourceMapping,
};

/// Application-facing creation description of a tracked resource.
#[derive(Debug, Clone)]
pub struct ResourceDesc {
    pub info: ResourceInfo,
    pub resource_type: ResourceTypeTag,
    pub name: Option<String>,
    pub format: String,
}

impl ResourceDesc {
    pub fn buffer(element_count: u32, name: Option<&str>) -> Self {
        Self {
            info: ResourceInfo::buffer(element_count),
            resource_type: ResourceTypeTag::Buffer,
            name: name.map(str::to_string),
            format: "R32".to_string(),
        }
    }

    pub fn texture_2d(width: u32, height: u32, mip_count: u32, name: Option<&str>) -> Self {
        Self {
            info: ResourceInfo::texture_2d(width, height, 1, mip_count),
            resource_type: ResourceTypeTag::Texture,
            name: name.map(str::to_string),
            format: "R8".to_string(),
        }
    }
}

/// One live physical resource: its process-unique id, its mapping
/// template, the texel region tracking it, and every descriptor slot it
/// is currently visible through.
pub struct ResourceState {
    pub puid: u32,
    pub desc: ResourceDesc,
    pub texel_allocation: Option<TexelMemoryAllocation>,
    /// `(segment, offset)` slots whose entries reference this resource;
    /// invalidated before the slots can be reused.
    pub bindings: Vec<(PhysicalResourceSegmentId, u32)>,
}

impl ResourceState {
    /// The table entry written for this resource.
    pub fn mapping(&self) -> VirtualResourceMapping {
        VirtualResourceMapping {
            token: ResourceToken {
                puid: self.puid,
                resource_type: self.desc.resource_type,
                srb: 0,
            },
            width: self.desc.info.width,
            height: self.desc.info.height,
            depth_or_slice_count: self.desc.info.depth_or_slice_count,
            mip_count: self.desc.info.mip_count,
            base_mip: 0,
            base_slice: 0,
        }
    }
}
