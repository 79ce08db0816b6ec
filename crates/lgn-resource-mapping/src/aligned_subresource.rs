//! Aligned-subresource addressing.
//!
//! Every dimension is aligned up to the next power of two, which makes the
//! whole-mip-chain size a closed form: with dimensionality `d`, the sum of
//! the mip sizes is `(total - mip) * 2^d / (2^d - 1)`. The same scheme is
//! emitted into instrumented shaders, so the host math here must match the
//! device math dword for dword.

/// Shape of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    /// Linear element addressing; `width` is the element count.
    Buffer,
    /// 1D/2D, optionally sliced; `depth_or_slice_count` is the slice count.
    Texture,
    /// 3D; `depth_or_slice_count` is the depth, mips shrink it.
    Volumetric,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceInfo {
    pub dimension: ResourceDimension,
    pub width: u32,
    pub height: u32,
    pub depth_or_slice_count: u32,
    pub mip_count: u32,
}

impl ResourceInfo {
    pub fn buffer(element_count: u32) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: element_count,
            height: 1,
            depth_or_slice_count: 1,
            mip_count: 1,
        }
    }

    pub fn texture_2d(width: u32, height: u32, slice_count: u32, mip_count: u32) -> Self {
        Self {
            dimension: ResourceDimension::Texture,
            width,
            height,
            depth_or_slice_count: slice_count,
            mip_count,
        }
    }

    pub fn texture_3d(width: u32, height: u32, depth: u32, mip_count: u32) -> Self {
        Self {
            dimension: ResourceDimension::Volumetric,
            width,
            height,
            depth_or_slice_count: depth,
            mip_count,
        }
    }
}

/// Addressing result: total texel count and one offset per subresource.
/// Subresources are ordered mip-major within slice, matching the runtime's
/// subresource indexing.
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub texel_count: u64,
    pub subresource_offsets: Vec<u64>,
}

fn align_pow2_upper(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

fn mip_dim(aligned: u64, mip: u32) -> u64 {
    (aligned >> mip).max(1)
}

/// `(difference * 2^d) / (2^d - 1)`, the geometric-series offset form.
fn mip_offset_from_difference(difference: u64, dimensionality: u32) -> u64 {
    let scale = 1u64 << dimensionality;
    difference * scale / (scale - 1)
}

/// Size of one aligned mip chain of a sliced texture.
fn mip_chain_size(width: u64, height: u64, mip_count: u32) -> u64 {
    let mip_w = mip_dim(width, mip_count);
    let mip_h = mip_dim(height, mip_count);
    mip_offset_from_difference(width * height - mip_w * mip_h, 2)
}

/// Compute the addressing info for a resource.
pub fn compute_address_info(info: &ResourceInfo) -> AddressInfo {
    match info.dimension {
        ResourceDimension::Buffer => AddressInfo {
            texel_count: u64::from(info.width),
            subresource_offsets: vec![0],
        },
        ResourceDimension::Texture => {
            let width = align_pow2_upper(u64::from(info.width));
            let height = align_pow2_upper(u64::from(info.height));
            let chain = mip_chain_size(width, height, info.mip_count);

            let mut offsets =
                Vec::with_capacity((info.depth_or_slice_count * info.mip_count) as usize);
            for slice in 0..u64::from(info.depth_or_slice_count) {
                let base = chain * slice;
                for mip in 0..info.mip_count {
                    let mip_w = mip_dim(width, mip);
                    let mip_h = mip_dim(height, mip);
                    let offset = mip_offset_from_difference(
                        width * height - mip_w * mip_h,
                        2,
                    );
                    offsets.push(base + offset);
                }
            }

            AddressInfo {
                texel_count: chain * u64::from(info.depth_or_slice_count),
                subresource_offsets: offsets,
            }
        }
        ResourceDimension::Volumetric => {
            let width = align_pow2_upper(u64::from(info.width));
            let height = align_pow2_upper(u64::from(info.height));
            let depth = align_pow2_upper(u64::from(info.depth_or_slice_count));
            let total = width * height * depth;

            let mut offsets = Vec::with_capacity(info.mip_count as usize);
            for mip in 0..info.mip_count {
                let mip_w = mip_dim(width, mip);
                let mip_h = mip_dim(height, mip);
                let mip_d = mip_dim(depth, mip);
                offsets.push(mip_offset_from_difference(
                    total - mip_w * mip_h * mip_d,
                    3,
                ));
            }

            let end_w = mip_dim(width, info.mip_count);
            let end_h = mip_dim(height, info.mip_count);
            let end_d = mip_dim(depth, info.mip_count);
            AddressInfo {
                texel_count: mip_offset_from_difference(total - end_w * end_h * end_d, 3),
                subresource_offsets: offsets,
            }
        }
    }
}

/// Texel offset of `(mip, slice, x, y, z)` within a resource's region.
pub fn texel_offset(info: &ResourceInfo, mip: u32, slice: u32, x: u32, y: u32, z: u32) -> u64 {
    let address = compute_address_info(info);

    match info.dimension {
        ResourceDimension::Buffer => u64::from(x),
        ResourceDimension::Texture => {
            let width = align_pow2_upper(u64::from(info.width));
            let mip_w = mip_dim(width, mip);
            let base = address.subresource_offsets[(slice * info.mip_count + mip) as usize];
            base + u64::from(x) + u64::from(y) * mip_w
        }
        ResourceDimension::Volumetric => {
            let width = align_pow2_upper(u64::from(info.width));
            let height = align_pow2_upper(u64::from(info.height));
            let mip_w = mip_dim(width, mip);
            let mip_h = mip_dim(height, mip);
            let base = address.subresource_offsets[mip as usize];
            base + u64::from(x) + u64::from(y) * mip_w + u64::from(z) * mip_w * mip_h
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_addresses_linearly() {
        let info = ResourceInfo::buffer(1000);
        let address = compute_address_info(&info);
        assert_eq!(address.texel_count, 1000);
        assert_eq!(address.subresource_offsets, vec![0]);
        assert_eq!(texel_offset(&info, 0, 0, 123, 0, 0), 123);
    }

    #[test]
    fn test_single_mip_texture() {
        let info = ResourceInfo::texture_2d(16, 16, 1, 1);
        let address = compute_address_info(&info);

        // One 16x16 mip.
        assert_eq!(address.texel_count, 256);
        assert_eq!(address.subresource_offsets, vec![0]);

        // Row-major within the mip.
        assert_eq!(texel_offset(&info, 0, 0, 3, 7, 0), 3 + 7 * 16);
    }

    #[test]
    fn test_mip_offsets_follow_geometric_series() {
        let info = ResourceInfo::texture_2d(16, 16, 1, 4);
        let address = compute_address_info(&info);

        // Offsets: 0, 256, 256+64, 256+64+16.
        assert_eq!(address.subresource_offsets, vec![0, 256, 320, 336]);
    }

    #[test]
    fn test_sliced_texture_strides_by_chain() {
        let info = ResourceInfo::texture_2d(8, 8, 2, 2);
        let address = compute_address_info(&info);

        // Chain of an 8x8 with 2 mips: (64 - 4) * 4 / 3 = 80.
        assert_eq!(address.subresource_offsets, vec![0, 64, 80, 144]);
        assert_eq!(address.texel_count, 160);
    }

    #[test]
    fn test_volumetric_mip_offsets() {
        let info = ResourceInfo::texture_3d(8, 8, 8, 2);
        let address = compute_address_info(&info);

        // Mip 1 starts after the 8x8x8 mip 0: (512 - 64) * 8 / 7 = 512.
        assert_eq!(address.subresource_offsets, vec![0, 512]);

        assert_eq!(texel_offset(&info, 1, 0, 1, 2, 3), 512 + 1 + 2 * 4 + 3 * 16);
    }

    #[test]
    fn test_non_pow2_dimensions_align_up() {
        let info = ResourceInfo::texture_2d(17, 9, 1, 1);
        let address = compute_address_info(&info);

        // Aligned to 32x16.
        assert_eq!(address.texel_count, 32 * 16);
        assert_eq!(texel_offset(&info, 0, 0, 0, 1, 0), 32);
    }
}
