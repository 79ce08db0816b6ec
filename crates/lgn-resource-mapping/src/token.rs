use byteorder::{ByteOrder, LittleEndian};

/// Bit budget of the packed token.
pub const PUID_BIT_COUNT: u32 = 22;
pub const TYPE_BIT_COUNT: u32 = 4;
pub const SRB_BIT_COUNT: u32 = 6;

/// Reserved PUID marking an unmapped descriptor slot.
pub const PUID_INVALID: u32 = (1 << PUID_BIT_COUNT) - 1;

/// Resource type identifier carried in the packed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceTypeTag {
    None = 0,
    Buffer = 1,
    Texture = 2,
    Sampler = 3,
    ConstantBuffer = 4,
}

impl ResourceTypeTag {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Buffer,
            2 => Self::Texture,
            3 => Self::Sampler,
            4 => Self::ConstantBuffer,
            _ => Self::None,
        }
    }
}

/// Unpacked resource token: `puid | type | sub-resource base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceToken {
    pub puid: u32,
    pub resource_type: ResourceTypeTag,
    /// Packed mip/slice baseline bits.
    pub srb: u32,
}

impl ResourceToken {
    pub fn invalid() -> Self {
        Self {
            puid: PUID_INVALID,
            resource_type: ResourceTypeTag::None,
            srb: 0,
        }
    }

    pub fn pack(&self) -> u32 {
        debug_assert!(self.puid < (1 << PUID_BIT_COUNT), "puid out of range");
        debug_assert!(self.srb < (1 << SRB_BIT_COUNT), "srb out of range");

        self.puid
            | ((self.resource_type as u32) << PUID_BIT_COUNT)
            | (self.srb << (PUID_BIT_COUNT + TYPE_BIT_COUNT))
    }

    pub fn unpack(packed: u32) -> Self {
        Self {
            puid: packed & ((1 << PUID_BIT_COUNT) - 1),
            resource_type: ResourceTypeTag::from_raw(
                (packed >> PUID_BIT_COUNT) & ((1 << TYPE_BIT_COUNT) - 1),
            ),
            srb: packed >> (PUID_BIT_COUNT + TYPE_BIT_COUNT),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.puid != PUID_INVALID
    }
}

/// One table entry as the shader reads it: the packed token and the
/// dimensions needed for texel addressing. The sub-resource baseline packs
/// base mip and base slice into the final dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualResourceMapping {
    pub token: ResourceToken,
    pub width: u32,
    pub height: u32,
    pub depth_or_slice_count: u32,
    pub mip_count: u32,
    pub base_mip: u16,
    pub base_slice: u16,
}

impl VirtualResourceMapping {
    /// GPU-side entry size.
    pub const BYTE_SIZE: usize = 24;

    pub fn invalid() -> Self {
        Self {
            token: ResourceToken::invalid(),
            width: 1,
            height: 1,
            depth_or_slice_count: 1,
            mip_count: 1,
            base_mip: 0,
            base_slice: 0,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::BYTE_SIZE);
        LittleEndian::write_u32(&mut out[0..4], self.token.pack());
        LittleEndian::write_u32(&mut out[4..8], self.width);
        LittleEndian::write_u32(&mut out[8..12], self.height);
        LittleEndian::write_u32(&mut out[12..16], self.depth_or_slice_count);
        LittleEndian::write_u32(&mut out[16..20], self.mip_count);
        LittleEndian::write_u32(
            &mut out[20..24],
            u32::from(self.base_mip) | (u32::from(self.base_slice) << 16),
        );
    }

    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::BYTE_SIZE);
        let base = LittleEndian::read_u32(&bytes[20..24]);
        Self {
            token: ResourceToken::unpack(LittleEndian::read_u32(&bytes[0..4])),
            width: LittleEndian::read_u32(&bytes[4..8]),
            height: LittleEndian::read_u32(&bytes[8..12]),
            depth_or_slice_count: LittleEndian::read_u32(&bytes[12..16]),
            mip_count: LittleEndian::read_u32(&bytes[16..20]),
            base_mip: (base & 0xFFFF) as u16,
            base_slice: (base >> 16) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_pack_unpack() {
        let token = ResourceToken {
            puid: 42,
            resource_type: ResourceTypeTag::Buffer,
            srb: 5,
        };

        let unpacked = ResourceToken::unpack(token.pack());
        assert_eq!(unpacked, token);
        assert!(token.is_valid());
        assert!(!ResourceToken::invalid().is_valid());
    }

    #[test]
    fn test_mapping_encode_decode() {
        let mapping = VirtualResourceMapping {
            token: ResourceToken {
                puid: 7,
                resource_type: ResourceTypeTag::Texture,
                srb: 0,
            },
            width: 256,
            height: 128,
            depth_or_slice_count: 6,
            mip_count: 9,
            base_mip: 2,
            base_slice: 3,
        };

        let mut bytes = [0u8; VirtualResourceMapping::BYTE_SIZE];
        mapping.encode(&mut bytes);
        assert_eq!(VirtualResourceMapping::decode(&bytes), mapping);
    }
}
