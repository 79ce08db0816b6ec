use byteorder::{ByteOrder, LittleEndian};

use crate::{signer, CodecError, Result, Signer};

/// `"DXBC"` read as a little-endian word.
pub const MAGIC: u32 = u32::from_le_bytes(*b"DXBC");

/// Byte size of the fixed container header.
pub const HEADER_SIZE: usize = 32;

/// Offset of the field the signature digest starts at.
pub(crate) const DIGEST_START: usize = 20;

const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub const FOURCC_DXIL: u32 = fourcc(b"DXIL");
pub const FOURCC_ILDB: u32 = fourcc(b"ILDB");
pub const FOURCC_ILDN: u32 = fourcc(b"ILDN");
pub const FOURCC_RDAT: u32 = fourcc(b"RDAT");
pub const FOURCC_PSV0: u32 = fourcc(b"PSV0");
pub const FOURCC_STAT: u32 = fourcc(b"STAT");
pub const FOURCC_SFI0: u32 = fourcc(b"SFI0");
pub const FOURCC_HASH: u32 = fourcc(b"HASH");
pub const FOURCC_ISG1: u32 = fourcc(b"ISG1");
pub const FOURCC_OSG1: u32 = fourcc(b"OSG1");
pub const FOURCC_ISGN: u32 = fourcc(b"ISGN");
pub const FOURCC_OSGN: u32 = fourcc(b"OSGN");
pub const FOURCC_RTS0: u32 = fourcc(b"RTS0");

/// Chunk kinds the codec recognizes. Anything else is carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Dxil,
    DebugIl,
    DebugName,
    RuntimeData,
    PipelineStateValidation,
    Statistics,
    FeatureInfo,
    ShaderHash,
    InputSignature,
    OutputSignature,
    RootSignature,
    Unexposed,
}

fn filter_chunk_kind(fourcc: u32) -> ChunkKind {
    match fourcc {
        FOURCC_DXIL => ChunkKind::Dxil,
        FOURCC_ILDB => ChunkKind::DebugIl,
        FOURCC_ILDN => ChunkKind::DebugName,
        FOURCC_RDAT => ChunkKind::RuntimeData,
        FOURCC_PSV0 => ChunkKind::PipelineStateValidation,
        FOURCC_STAT => ChunkKind::Statistics,
        FOURCC_SFI0 => ChunkKind::FeatureInfo,
        FOURCC_HASH => ChunkKind::ShaderHash,
        FOURCC_ISG1 | FOURCC_ISGN => ChunkKind::InputSignature,
        FOURCC_OSG1 | FOURCC_OSGN => ChunkKind::OutputSignature,
        FOURCC_RTS0 => ChunkKind::RootSignature,
        _ => ChunkKind::Unexposed,
    }
}

/// Fixed container header.
#[derive(Debug, Clone, Copy)]
pub struct DxbcHeader {
    pub checksum: [u8; 16],
    pub reserved: u32,
    pub byte_count: u32,
    pub chunk_count: u32,
}

/// One chunk: its source location, and an optional rewritten payload that
/// replaces the source bytes on stitch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub fourcc: u32,
    pub kind: ChunkKind,
    /// Byte offset of the chunk payload in the parse source.
    pub offset: usize,
    pub length: usize,
    pub replacement: Option<Vec<u8>>,
}

/// A scanned DXBC container.
pub struct DxbcModule {
    shader_guid: u64,
    bytes: Vec<u8>,
    header: DxbcHeader,
    chunks: Vec<Chunk>,
}

impl DxbcModule {
    /// Scan a container byte stream.
    ///
    /// # Errors
    ///
    /// Any malformed input fails with [`CodecError::ShaderParsingFailed`];
    /// the scan never panics on application-supplied bytes.
    pub fn parse(bytes: &[u8], shader_guid: u64) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::ShaderParsingFailed(format!(
                "container of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != MAGIC {
            return Err(CodecError::ShaderParsingFailed(format!(
                "unexpected magic {:#010x}",
                magic
            )));
        }

        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&bytes[4..20]);

        let header = DxbcHeader {
            checksum,
            reserved: LittleEndian::read_u32(&bytes[20..24]),
            byte_count: LittleEndian::read_u32(&bytes[24..28]),
            chunk_count: LittleEndian::read_u32(&bytes[28..32]),
        };

        let table_end = HEADER_SIZE + header.chunk_count as usize * 4;
        if table_end > bytes.len() {
            return Err(CodecError::ShaderParsingFailed(format!(
                "chunk table of {} entries overruns the container",
                header.chunk_count
            )));
        }

        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        for index in 0..header.chunk_count as usize {
            let entry_offset = HEADER_SIZE + index * 4;
            let chunk_offset =
                LittleEndian::read_u32(&bytes[entry_offset..entry_offset + 4]) as usize;

            if chunk_offset + 8 > bytes.len() {
                return Err(CodecError::ShaderParsingFailed(format!(
                    "chunk {} header at {} overruns the container",
                    index, chunk_offset
                )));
            }

            let fourcc = LittleEndian::read_u32(&bytes[chunk_offset..chunk_offset + 4]);
            let length =
                LittleEndian::read_u32(&bytes[chunk_offset + 4..chunk_offset + 8]) as usize;

            let data_offset = chunk_offset + 8;
            if data_offset + length > bytes.len() {
                return Err(CodecError::ShaderParsingFailed(format!(
                    "chunk {} payload of {} bytes overruns the container",
                    index, length
                )));
            }

            chunks.push(Chunk {
                fourcc,
                kind: filter_chunk_kind(fourcc),
                offset: data_offset,
                length,
                replacement: None,
            });
        }

        Ok(Self {
            shader_guid,
            bytes: bytes.to_vec(),
            header,
            chunks,
        })
    }

    pub fn shader_guid(&self) -> u64 {
        self.shader_guid
    }

    pub fn header(&self) -> &DxbcHeader {
        &self.header
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// First chunk of the given kind, if present.
    pub fn chunk(&self, kind: ChunkKind) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.kind == kind)
    }

    /// Payload bytes of a chunk, honoring any staged replacement.
    pub fn chunk_data<'a>(&'a self, chunk: &'a Chunk) -> &'a [u8] {
        match &chunk.replacement {
            Some(data) => data,
            None => &self.bytes[chunk.offset..chunk.offset + chunk.length],
        }
    }

    /// Stage a rewritten payload for the first chunk of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmissionFailed`] when the container has no such
    /// chunk.
    pub fn replace_chunk(&mut self, kind: ChunkKind, data: Vec<u8>) -> Result<()> {
        match self.chunks.iter_mut().find(|c| c.kind == kind) {
            Some(chunk) => {
                chunk.replacement = Some(data);
                Ok(())
            }
            None => Err(CodecError::EmissionFailed(format!(
                "container has no {:?} chunk",
                kind
            ))),
        }
    }

    /// Whether any chunk carries a staged replacement.
    pub fn is_dirty(&self) -> bool {
        self.chunks.iter().any(|c| c.replacement.is_some())
    }

    /// Stitch the container back together: header, offset table, chunks.
    /// Chunks with staged payloads use them; everything else is copied from
    /// the parse source by offset and length. The checksum field is zeroed
    /// and recomputed by the signer, when one is given.
    ///
    /// # Errors
    ///
    /// Propagates signer failures; release configurations fall back to the
    /// bypass signer before reaching this point.
    pub fn stitch(&self, signer: Option<&dyn Signer>) -> Result<Vec<u8>> {
        let chunk_count = self.chunks.len();

        let mut payload_size = 0usize;
        for chunk in &self.chunks {
            payload_size += 8 + self.chunk_data(chunk).len();
        }

        let total = HEADER_SIZE + chunk_count * 4 + payload_size;
        let mut out = Vec::with_capacity(total);

        // Header with a zeroed checksum; signed below.
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&self.header.reserved.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(chunk_count as u32).to_le_bytes());

        // Offset table.
        let mut chunk_offset = HEADER_SIZE + chunk_count * 4;
        for chunk in &self.chunks {
            out.extend_from_slice(&(chunk_offset as u32).to_le_bytes());
            chunk_offset += 8 + self.chunk_data(chunk).len();
        }

        // Chunks.
        for chunk in &self.chunks {
            let data = self.chunk_data(chunk);
            out.extend_from_slice(&chunk.fourcc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }

        match signer {
            Some(signer) => signer.sign(&mut out)?,
            None => signer::sign_with_bypass(&mut out)?,
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_container(chunks: &[(u32, &[u8])]) -> Vec<u8> {
        let chunk_count = chunks.len();
        let payload: usize = chunks.iter().map(|(_, d)| 8 + d.len()).sum();
        let total = HEADER_SIZE + chunk_count * 4 + payload;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(chunk_count as u32).to_le_bytes());

        let mut offset = HEADER_SIZE + chunk_count * 4;
        for (_, data) in chunks {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += 8 + data.len();
        }

        for (fourcc, data) in chunks {
            out.extend_from_slice(&fourcc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }

        signer::sign_with_bypass(&mut out).unwrap();
        out
    }

    #[test]
    fn test_scan_recognizes_chunks() {
        let bytes = build_container(&[
            (FOURCC_DXIL, b"dxil-payload"),
            (FOURCC_PSV0, b"psv-payload!"),
            (fourcc(b"ZZZZ"), b"mystery"),
        ]);

        let module = DxbcModule::parse(&bytes, 9).unwrap();
        assert_eq!(module.chunks().len(), 3);
        assert_eq!(module.chunks()[0].kind, ChunkKind::Dxil);
        assert_eq!(
            module.chunks()[1].kind,
            ChunkKind::PipelineStateValidation
        );
        assert_eq!(module.chunks()[2].kind, ChunkKind::Unexposed);
        assert_eq!(module.chunk_data(&module.chunks()[2]), b"mystery");
    }

    #[test]
    fn test_stitch_identity_without_replacement() {
        let bytes = build_container(&[(FOURCC_DXIL, b"dxil-payload"), (fourcc(b"ZZZZ"), b"keep")]);
        let module = DxbcModule::parse(&bytes, 9).unwrap();
        assert_eq!(module.stitch(None).unwrap(), bytes);
    }

    #[test]
    fn test_zero_chunk_container_roundtrips() {
        let bytes = build_container(&[]);
        let module = DxbcModule::parse(&bytes, 9).unwrap();
        assert_eq!(module.header().chunk_count, 0);
        assert_eq!(module.stitch(None).unwrap(), bytes);
    }

    #[test]
    fn test_replacement_changes_only_target_chunk() {
        let bytes = build_container(&[
            (FOURCC_PSV0, b"old-psv-data"),
            (fourcc(b"ZZZZ"), b"untouched"),
        ]);

        let mut module = DxbcModule::parse(&bytes, 9).unwrap();
        module
            .replace_chunk(ChunkKind::PipelineStateValidation, b"new-psv!".to_vec())
            .unwrap();
        assert!(module.is_dirty());

        let stitched = module.stitch(None).unwrap();
        let restitched = DxbcModule::parse(&stitched, 9).unwrap();
        assert_eq!(
            restitched.chunk_data(restitched.chunk(ChunkKind::PipelineStateValidation).unwrap()),
            b"new-psv!"
        );
        assert_eq!(
            restitched.chunk_data(restitched.chunk(ChunkKind::Unexposed).unwrap()),
            b"untouched"
        );
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = build_container(&[]);
        bytes[0] = b'X';
        assert!(matches!(
            DxbcModule::parse(&bytes, 9),
            Err(CodecError::ShaderParsingFailed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_overrunning_chunk() {
        let mut bytes = build_container(&[(FOURCC_DXIL, b"data")]);
        // Corrupt the chunk length to reach past the container.
        let chunk_header = HEADER_SIZE + 4;
        bytes[chunk_header + 4] = 0xFF;
        assert!(DxbcModule::parse(&bytes, 9).is_err());
    }
}
