//! Pipeline-state-validation (`PSV0`) chunk rewriting.
//!
//! The runtime cross-checks a pipeline's root signature against the
//! resource bindings declared here, so the injected registers must be
//! appended before stitching or the instrumented binary is rejected.

use byteorder::{ByteOrder, LittleEndian};

use crate::{CodecError, Result};

/// The fixed register layout an instrumented shader is compiled against.
/// Constant per root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRegisterBindingInfo {
    /// Register space reserved for the layer.
    pub space: u32,

    /// Shader export stream registers.
    pub shader_export_base_register: u32,
    pub shader_export_count: u32,

    /// PRMT registers.
    pub resource_prmt_base_register: u32,
    pub sampler_prmt_base_register: u32,

    /// Constant registers.
    pub shader_data_constant_register: u32,
    pub descriptor_constant_base_register: u32,
    pub event_constant_base_register: u32,

    /// User shader-data resource registers.
    pub shader_resource_base_register: u32,
    pub shader_resource_count: u32,
}

/// Resource type of a bind info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BindInfoType {
    Invalid = 0,
    Sampler = 1,
    ConstantBuffer = 2,
    ShaderResourceView = 3,
    ShaderResourceViewByte = 4,
    ShaderResourceViewStructured = 5,
    UnorderedAccessView = 6,
    UnorderedAccessViewByte = 7,
    UnorderedAccessViewStructured = 8,
    UnorderedAccessViewCounter = 9,
}

impl BindInfoType {
    fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::Invalid,
            1 => Self::Sampler,
            2 => Self::ConstantBuffer,
            3 => Self::ShaderResourceView,
            4 => Self::ShaderResourceViewByte,
            5 => Self::ShaderResourceViewStructured,
            6 => Self::UnorderedAccessView,
            7 => Self::UnorderedAccessViewByte,
            8 => Self::UnorderedAccessViewStructured,
            9 => Self::UnorderedAccessViewCounter,
            other => {
                return Err(CodecError::ShaderParsingFailed(format!(
                    "invalid bind info type {}",
                    other
                )))
            }
        })
    }
}

/// Resource kind of a revision-1 bind info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BindInfoKind {
    Invalid = 0,
    TypedBuffer = 10,
    RawBuffer = 11,
    StructuredBuffer = 12,
    ConstantBuffer = 13,
    Sampler = 14,
    Unexposed = u32::MAX,
}

impl BindInfoKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Invalid,
            10 => Self::TypedBuffer,
            11 => Self::RawBuffer,
            12 => Self::StructuredBuffer,
            13 => Self::ConstantBuffer,
            14 => Self::Sampler,
            _ => Self::Unexposed,
        }
    }

    fn to_raw(self, raw_source: u32) -> u32 {
        match self {
            Self::Unexposed => raw_source,
            other => other as u32,
        }
    }
}

const BIND_INFO0_SIZE: u32 = 16;
const BIND_INFO1_SIZE: u32 = 24;

/// One resource binding, revision 1 superset. Revision-0 blocks carry only
/// the first four fields.
#[derive(Debug, Clone, Copy)]
pub struct BindInfo {
    pub bind_type: BindInfoType,
    pub space: u32,
    pub low: u32,
    pub high: u32,
    pub kind: BindInfoKind,
    pub flags: u32,
    /// Raw kind word, carried for unexposed kinds.
    raw_kind: u32,
}

impl BindInfo {
    pub fn new(bind_type: BindInfoType, space: u32, low: u32, high: u32, kind: BindInfoKind) -> Self {
        Self {
            bind_type,
            space,
            low,
            high,
            kind,
            flags: 0,
            raw_kind: kind as u32,
        }
    }
}

/// A parsed `PSV0` block, preserving everything the codec does not model.
pub struct PsvBlock {
    /// Runtime info, carried verbatim at its declared size.
    runtime_info: Vec<u8>,
    bindings_size: u32,
    bindings: Vec<BindInfo>,
    /// Bytes after the resource table: string tables, signature elements,
    /// view maps. Preserved verbatim.
    trailing: Vec<u8>,
}

impl PsvBlock {
    /// Parse a `PSV0` chunk payload.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::ShaderParsingFailed`] on truncation or an
    /// invalid resource table.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;

        let runtime_info_size = read_u32(bytes, &mut cursor)? as usize;
        if cursor + runtime_info_size > bytes.len() {
            return Err(CodecError::ShaderParsingFailed(
                "psv runtime info overruns the chunk".to_string(),
            ));
        }
        let runtime_info = bytes[cursor..cursor + runtime_info_size].to_vec();
        cursor += runtime_info_size;

        let resource_count = read_u32(bytes, &mut cursor)?;

        // An empty table carries no explicit entry size.
        if resource_count == 0 {
            return Ok(Self {
                runtime_info,
                bindings_size: BIND_INFO1_SIZE,
                bindings: Vec::new(),
                trailing: bytes[cursor..].to_vec(),
            });
        }

        let bindings_size = read_u32(bytes, &mut cursor)?;
        if bindings_size < BIND_INFO0_SIZE {
            return Err(CodecError::ShaderParsingFailed(format!(
                "psv bind info size {} below the revision-0 layout",
                bindings_size
            )));
        }

        let mut bindings = Vec::with_capacity(resource_count as usize);
        for _ in 0..resource_count {
            if cursor + bindings_size as usize > bytes.len() {
                return Err(CodecError::ShaderParsingFailed(
                    "psv resource table overruns the chunk".to_string(),
                ));
            }

            let entry = &bytes[cursor..cursor + bindings_size as usize];
            let raw_kind = if bindings_size >= BIND_INFO1_SIZE {
                LittleEndian::read_u32(&entry[16..20])
            } else {
                0
            };

            bindings.push(BindInfo {
                bind_type: BindInfoType::from_raw(LittleEndian::read_u32(&entry[0..4]))?,
                space: LittleEndian::read_u32(&entry[4..8]),
                low: LittleEndian::read_u32(&entry[8..12]),
                high: LittleEndian::read_u32(&entry[12..16]),
                kind: BindInfoKind::from_raw(raw_kind),
                flags: if bindings_size >= BIND_INFO1_SIZE {
                    LittleEndian::read_u32(&entry[20..24])
                } else {
                    0
                },
                raw_kind,
            });

            cursor += bindings_size as usize;
        }

        Ok(Self {
            runtime_info,
            bindings_size,
            bindings,
            trailing: bytes[cursor..].to_vec(),
        })
    }

    pub fn bindings(&self) -> &[BindInfo] {
        &self.bindings
    }

    /// Append the layer's injected registers: one UAV range for the export
    /// streams, the two PRMT SRVs, the three constant buffers, and one UAV
    /// per user shader-data resource.
    pub fn append_instrumentation_bindings(
        &mut self,
        binding_info: &RootRegisterBindingInfo,
        shader_data_resource_count: u32,
    ) {
        self.bindings.push(BindInfo::new(
            BindInfoType::UnorderedAccessView,
            binding_info.space,
            binding_info.shader_export_base_register,
            binding_info.shader_export_base_register + binding_info.shader_export_count - 1,
            BindInfoKind::TypedBuffer,
        ));

        self.bindings.push(BindInfo::new(
            BindInfoType::ShaderResourceView,
            binding_info.space,
            binding_info.resource_prmt_base_register,
            binding_info.resource_prmt_base_register,
            BindInfoKind::TypedBuffer,
        ));

        self.bindings.push(BindInfo::new(
            BindInfoType::ShaderResourceView,
            binding_info.space,
            binding_info.sampler_prmt_base_register,
            binding_info.sampler_prmt_base_register,
            BindInfoKind::TypedBuffer,
        ));

        for register in [
            binding_info.shader_data_constant_register,
            binding_info.descriptor_constant_base_register,
            binding_info.event_constant_base_register,
        ] {
            self.bindings.push(BindInfo::new(
                BindInfoType::ConstantBuffer,
                binding_info.space,
                register,
                register,
                BindInfoKind::ConstantBuffer,
            ));
        }

        for offset in 0..shader_data_resource_count {
            self.bindings.push(BindInfo::new(
                BindInfoType::UnorderedAccessView,
                binding_info.space,
                binding_info.shader_resource_base_register + offset,
                binding_info.shader_resource_base_register + offset,
                BindInfoKind::TypedBuffer,
            ));
        }
    }

    /// Re-emit the chunk payload: runtime info at its original size, the
    /// resource table at the original entry size, then the preserved tail.
    pub fn compile(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.runtime_info.len()
                + self.bindings.len() * self.bindings_size as usize
                + 4
                + self.trailing.len(),
        );

        out.extend_from_slice(&(self.runtime_info.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.runtime_info);
        out.extend_from_slice(&(self.bindings.len() as u32).to_le_bytes());

        if !self.bindings.is_empty() {
            out.extend_from_slice(&self.bindings_size.to_le_bytes());

            for binding in &self.bindings {
                let mut entry = vec![0u8; self.bindings_size as usize];
                LittleEndian::write_u32(&mut entry[0..4], binding.bind_type as u32);
                LittleEndian::write_u32(&mut entry[4..8], binding.space);
                LittleEndian::write_u32(&mut entry[8..12], binding.low);
                LittleEndian::write_u32(&mut entry[12..16], binding.high);
                if self.bindings_size >= BIND_INFO1_SIZE {
                    LittleEndian::write_u32(
                        &mut entry[16..20],
                        binding.kind.to_raw(binding.raw_kind),
                    );
                    LittleEndian::write_u32(&mut entry[20..24], binding.flags);
                }
                out.extend_from_slice(&entry);
            }
        }

        out.extend_from_slice(&self.trailing);
        out
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if *cursor + 4 > bytes.len() {
        return Err(CodecError::ShaderParsingFailed(
            "psv chunk truncated".to_string(),
        ));
    }
    let value = LittleEndian::read_u32(&bytes[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_info() -> RootRegisterBindingInfo {
        RootRegisterBindingInfo {
            space: 1000,
            shader_export_base_register: 0,
            shader_export_count: 2,
            resource_prmt_base_register: 2,
            sampler_prmt_base_register: 3,
            shader_data_constant_register: 0,
            descriptor_constant_base_register: 1,
            event_constant_base_register: 2,
            shader_resource_base_register: 4,
            shader_resource_count: 1,
        }
    }

    fn sample_block() -> Vec<u8> {
        let mut bytes = Vec::new();
        // 8-byte runtime info.
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA; 8]);
        // One CBV at space 0 register 0, revision 1 entries.
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&BIND_INFO1_SIZE.to_le_bytes());
        for value in [2u32, 0, 0, 0, 13, 0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        // Trailing string table bytes.
        bytes.extend_from_slice(b"tail");
        bytes
    }

    #[test]
    fn test_parse_compile_identity() {
        let bytes = sample_block();
        let block = PsvBlock::parse(&bytes).unwrap();
        assert_eq!(block.compile(), bytes);
    }

    #[test]
    fn test_appended_bindings_round_trip() {
        let mut block = PsvBlock::parse(&sample_block()).unwrap();
        block.append_instrumentation_bindings(&binding_info(), 1);

        let compiled = block.compile();
        let reparsed = PsvBlock::parse(&compiled).unwrap();

        // 1 original + 1 export UAV + 2 PRMT SRVs + 3 CBVs + 1 user UAV.
        assert_eq!(reparsed.bindings().len(), 8);

        let export = &reparsed.bindings()[1];
        assert_eq!(export.bind_type, BindInfoType::UnorderedAccessView);
        assert_eq!(export.space, 1000);
        assert_eq!(export.low, 0);
        assert_eq!(export.high, 1);

        let trailing = &compiled[compiled.len() - 4..];
        assert_eq!(trailing, b"tail");
    }

    #[test]
    fn test_empty_resource_table() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0x11; 4]);
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let block = PsvBlock::parse(&bytes).unwrap();
        assert!(block.bindings().is_empty());
        assert_eq!(block.compile(), bytes);
    }

    #[test]
    fn test_truncated_block_fails() {
        let bytes = vec![0xFF, 0xFF];
        assert!(PsvBlock::parse(&bytes).is_err());
    }
}
