//! DXIL payload codec.
//!
//! A `DXIL` chunk wraps an LLVM bitcode stream behind a small program
//! header. The scanner walks the block structure into an entry tree —
//! records (with the abbreviation they were encoded through), local
//! abbreviation definitions, nested blocks — honoring blockinfo-registered
//! abbreviations so real function blocks decode. Blocks whose encoding
//! context the scanner cannot follow degrade to verbatim word ranges, so
//! the walk is total on any input.
//!
//! Re-emission mirrors the scan: a clean chunk emits its original bytes,
//! a mutated one re-encodes the entry tree (abbreviation-aware, raw
//! ranges copied word for word) and patches the wrapper sizes. Function
//! bodies lift into the shared IL as opaque records for symbolization;
//! rewriting operates at record granularity through the entry tree.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use lgn_shader_il::{BasicBlock, Instruction, Op, Program, SourceSpan, Type};

use crate::bitstream::{
    Abbreviation, AbbrevOperand, BitstreamEntry, BitstreamReader, BitstreamWriter,
    DEFINE_ABBREV, END_BLOCK, ENTER_SUBBLOCK, FIRST_APPLICATION_ABBREV,
};
use crate::{CodecError, Result};

/// `"DXIL"` tag inside the program header.
pub const DXIL_MAGIC: u32 = u32::from_le_bytes(*b"DXIL");

/// Leading bitcode magic, `'BC' 0xC0 0xDE`.
pub const BITCODE_MAGIC: [u8; 4] = [0x42, 0x43, 0xC0, 0xDE];

/// Byte size of the DXIL program header.
pub const PROGRAM_HEADER_SIZE: usize = 24;

/// Well-known block ids.
pub const BLOCK_BLOCKINFO: u64 = 0;
pub const BLOCK_MODULE: u64 = 8;
pub const BLOCK_CONSTANTS: u64 = 11;
pub const BLOCK_FUNCTION: u64 = 12;
pub const BLOCK_METADATA: u64 = 15;
pub const BLOCK_TYPE: u64 = 17;

/// Blockinfo record assigning the block id subsequent abbreviation
/// definitions register against.
pub const BLOCKINFO_SETBID: u64 = 1;

/// One scanned record: its code, resolved fields, optional blob, the
/// abbreviation it was encoded with, and its bit position.
#[derive(Debug, Clone)]
pub struct DxilRecord {
    pub code: u64,
    pub fields: Vec<u64>,
    pub blob: Option<Vec<u8>>,
    /// `None` for the unabbreviated form.
    pub abbrev_id: Option<u64>,
    /// Bit offset of the record in the bitcode stream.
    pub bit_offset: usize,
}

/// One entry of a block body, in stream order. The order is what
/// re-encoding replays.
#[derive(Debug, Clone)]
pub enum DxilEntry {
    Record(DxilRecord),
    Block(DxilBlock),
    DefineAbbrev(Abbreviation),
}

/// One scanned block: id, declared abbreviation width, span, and its body.
#[derive(Debug, Clone)]
pub struct DxilBlock {
    pub block_id: u64,
    pub abbrev_width: u32,
    /// Bit offset of the block body in the bitcode stream.
    pub bit_offset: usize,
    pub entries: Vec<DxilEntry>,
    /// Body words preserved verbatim when the scan lost context; the
    /// entry list is empty in that case.
    pub raw: Option<Vec<u32>>,
}

impl DxilBlock {
    /// True when the scan bailed out and the body is carried verbatim.
    pub fn skipped(&self) -> bool {
        self.raw.is_some()
    }

    pub fn records(&self) -> impl Iterator<Item = &DxilRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            DxilEntry::Record(record) => Some(record),
            _ => None,
        })
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DxilRecord> {
        self.entries.iter_mut().filter_map(|entry| match entry {
            DxilEntry::Record(record) => Some(record),
            _ => None,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = &DxilBlock> {
        self.entries.iter().filter_map(|entry| match entry {
            DxilEntry::Block(block) => Some(block),
            _ => None,
        })
    }
}

/// Parsed program header of a `DXIL` chunk.
#[derive(Debug, Clone, Copy)]
pub struct DxilProgramHeader {
    pub program_version: u32,
    pub size_in_dwords: u32,
    pub dxil_version: u32,
    pub bitcode_offset: u32,
    pub bitcode_size: u32,
}

/// A scanned DXIL chunk: the wrapper header, the block tree, and the
/// original payload for identity emission.
pub struct DxilChunk {
    header: DxilProgramHeader,
    payload: Vec<u8>,
    /// Byte offset of the bitcode magic in the payload.
    bitcode_start: usize,
    bitcode_end: usize,
    blocks: Vec<DxilBlock>,
    dirty: bool,
}

impl DxilChunk {
    /// Scan a `DXIL` chunk payload.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::ShaderParsingFailed`] when the wrapper
    /// header or the bitcode magic is malformed. The block walk itself is
    /// total: unstructurable bodies degrade to preserved ranges.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PROGRAM_HEADER_SIZE {
            return Err(CodecError::ShaderParsingFailed(format!(
                "dxil payload of {} bytes is shorter than the program header",
                bytes.len()
            )));
        }

        let magic = LittleEndian::read_u32(&bytes[8..12]);
        if magic != DXIL_MAGIC {
            return Err(CodecError::ShaderParsingFailed(format!(
                "unexpected dxil magic {:#010x}",
                magic
            )));
        }

        let header = DxilProgramHeader {
            program_version: LittleEndian::read_u32(&bytes[0..4]),
            size_in_dwords: LittleEndian::read_u32(&bytes[4..8]),
            dxil_version: LittleEndian::read_u32(&bytes[12..16]),
            bitcode_offset: LittleEndian::read_u32(&bytes[16..20]),
            bitcode_size: LittleEndian::read_u32(&bytes[20..24]),
        };

        // The bitcode offset is relative to the bitcode header at byte 8.
        let bitcode_start = 8 + header.bitcode_offset as usize;
        let bitcode_end = bitcode_start + header.bitcode_size as usize;
        if bitcode_start > bytes.len() || bitcode_end > bytes.len() {
            return Err(CodecError::ShaderParsingFailed(
                "bitcode range overruns the dxil payload".to_string(),
            ));
        }

        let bitcode = &bytes[bitcode_start..bitcode_end];
        if bitcode.len() < 4 || bitcode[0..4] != BITCODE_MAGIC {
            return Err(CodecError::ShaderParsingFailed(
                "missing bitcode magic".to_string(),
            ));
        }

        let mut reader = BitstreamReader::new(&bitcode[4..]);
        let mut blockinfo: HashMap<u64, Vec<Abbreviation>> = HashMap::new();
        let mut blocks = Vec::new();

        // Top level: only subblocks are expected, at the initial width.
        while !reader.at_end() {
            // Trailing sub-word padding terminates the stream.
            if remaining_bits(&reader, bitcode.len() - 4) < 32 {
                break;
            }

            match reader.read_entry(2, &[]) {
                Ok(BitstreamEntry::EnterSubBlock {
                    block_id,
                    abbrev_width,
                    length_words,
                }) => {
                    blocks.push(scan_block(
                        &mut reader,
                        block_id,
                        abbrev_width,
                        length_words,
                        &mut blockinfo,
                    )?);
                }
                Ok(_) | Err(_) => break,
            }
        }

        Ok(Self {
            header,
            payload: bytes.to_vec(),
            bitcode_start,
            bitcode_end,
            blocks,
            dirty: false,
        })
    }

    pub fn header(&self) -> &DxilProgramHeader {
        &self.header
    }

    pub fn blocks(&self) -> &[DxilBlock] {
        &self.blocks
    }

    /// Mutable block tree; taking it marks the chunk dirty and re-encodes
    /// on the next emission.
    pub fn blocks_mut(&mut self) -> &mut Vec<DxilBlock> {
        self.dirty = true;
        &mut self.blocks
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Locate the module block, when the scan surfaced one.
    pub fn module_block(&self) -> Option<&DxilBlock> {
        self.blocks.iter().find(|b| b.block_id == BLOCK_MODULE)
    }

    /// Re-emit the chunk payload.
    ///
    /// A chunk whose block tree was never touched emits the original
    /// bytes unchanged. A mutated one re-encodes the tree and patches the
    /// wrapper's size fields.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::EmissionFailed`] when a record no longer
    /// matches the abbreviation it was encoded with.
    pub fn emit(&self) -> Result<Vec<u8>> {
        if !self.dirty {
            return Ok(self.payload.clone());
        }

        let stream = encode_stream(&self.blocks)?;

        let mut out = self.payload[..self.bitcode_start].to_vec();
        out.extend_from_slice(&BITCODE_MAGIC);
        out.extend_from_slice(&stream);
        out.extend_from_slice(&self.payload[self.bitcode_end..]);

        // Patch the wrapper: bitcode size, then whole-program dwords.
        let bitcode_size = (4 + stream.len()) as u32;
        LittleEndian::write_u32(&mut out[20..24], bitcode_size);
        let size_in_dwords = (out.len() / 4) as u32;
        LittleEndian::write_u32(&mut out[4..8], size_in_dwords);

        Ok(out)
    }

    /// Lift the scanned function blocks into the shared IL.
    ///
    /// DXIL instructions surface as opaque records with their bit offsets
    /// as source spans, which is what symbolization resolves; feature
    /// checks are injected on the SPIR-V representation, and container
    /// rewriting here operates on the record tree.
    pub fn program(&self, shader_guid: u64) -> Program {
        let mut program = Program::new(shader_guid);
        let void = program.types.get_or_add(Type::Void);

        let Some(module) = self.module_block() else {
            return program;
        };

        for child in module.children() {
            if child.block_id != BLOCK_FUNCTION || child.skipped() {
                continue;
            }

            let fid = program.add_function(void);
            let block_id = program.ids_mut().allocate_block();
            let mut block = BasicBlock::new(block_id);

            for record in child.records() {
                block.push(Instruction::with_source(
                    Op::Unexposed {
                        opcode: record.code as u32,
                        words: record.fields.iter().map(|f| *f as u32).collect(),
                    },
                    None,
                    SourceSpan::new(record.bit_offset as u32),
                ));
            }

            program
                .function_mut(fid)
                .expect("just added")
                .add_existing_block(block);
        }

        program
    }
}

fn remaining_bits(reader: &BitstreamReader<'_>, total_bytes: usize) -> usize {
    total_bytes * 8 - reader.bit_pos()
}

/// Scan one block body. Abbreviations resolve against the blockinfo
/// registry for the block id plus local definitions; a blockinfo block
/// registers its definitions instead of keeping them. On anything the
/// reader cannot follow, the body is preserved verbatim by its declared
/// word length.
fn scan_block(
    reader: &mut BitstreamReader<'_>,
    block_id: u64,
    abbrev_width: u32,
    length_words: u32,
    blockinfo: &mut HashMap<u64, Vec<Abbreviation>>,
) -> Result<DxilBlock> {
    let body_start = reader.bit_pos();
    let body_end = body_start + length_words as usize * 32;

    let mut block = DxilBlock {
        block_id,
        abbrev_width,
        bit_offset: body_start,
        entries: Vec::new(),
        raw: None,
    };

    let mut abbrevs: Vec<Abbreviation> = blockinfo.get(&block_id).cloned().unwrap_or_default();
    let mut blockinfo_bid: Option<u64> = None;

    loop {
        if reader.bit_pos() > body_end {
            return Err(CodecError::ShaderParsingFailed(format!(
                "block {} overran its declared length",
                block_id
            )));
        }

        let entry_offset = reader.bit_pos();
        match reader.read_entry(abbrev_width, &abbrevs) {
            Ok(BitstreamEntry::EndBlock) => break,
            Ok(BitstreamEntry::EnterSubBlock {
                block_id: child_id,
                abbrev_width: child_width,
                length_words: child_length,
            }) => {
                block.entries.push(DxilEntry::Block(scan_block(
                    reader,
                    child_id,
                    child_width,
                    child_length,
                    blockinfo,
                )?));
            }
            Ok(BitstreamEntry::DefineAbbrev(abbrev)) => {
                if block_id == BLOCK_BLOCKINFO {
                    // Blockinfo definitions attach to the target block id,
                    // not to the blockinfo block itself.
                    blockinfo
                        .entry(blockinfo_bid.unwrap_or(0))
                        .or_default()
                        .push(abbrev.clone());
                } else {
                    abbrevs.push(abbrev.clone());
                }
                block.entries.push(DxilEntry::DefineAbbrev(abbrev));
            }
            Ok(BitstreamEntry::Record {
                abbrev_id,
                code,
                fields,
                blob,
            }) => {
                if block_id == BLOCK_BLOCKINFO && code == BLOCKINFO_SETBID {
                    blockinfo_bid = fields.first().copied();
                }
                block.entries.push(DxilEntry::Record(DxilRecord {
                    code,
                    fields,
                    blob,
                    abbrev_id,
                    bit_offset: entry_offset,
                }));
            }
            Err(_) => {
                // Lost context; carry the body verbatim instead.
                log::debug!("dxil block {} scan lost context, preserving raw", block_id);
                block.entries.clear();
                reader.seek_bit(body_end)?;
                block.raw = Some(reader.aligned_words(body_start, body_end)?);
                break;
            }
        }
    }

    Ok(block)
}

/// Re-encode a block tree, replaying the scan's abbreviation bookkeeping.
fn encode_stream(blocks: &[DxilBlock]) -> Result<Vec<u8>> {
    let mut writer = BitstreamWriter::new();
    let mut blockinfo: HashMap<u64, Vec<Abbreviation>> = HashMap::new();

    for block in blocks {
        encode_block(&mut writer, block, 2, &mut blockinfo)?;
    }

    writer.align32();
    Ok(writer.into_bytes())
}

fn encode_block(
    writer: &mut BitstreamWriter,
    block: &DxilBlock,
    parent_width: u32,
    blockinfo: &mut HashMap<u64, Vec<Abbreviation>>,
) -> Result<()> {
    writer.write(ENTER_SUBBLOCK, parent_width);
    writer.write_vbr(block.block_id, 8);
    writer.write_vbr(u64::from(block.abbrev_width), 4);
    writer.align32();

    let length_at = writer.reserve_word();
    let body_start = writer.bit_pos();

    if let Some(raw) = &block.raw {
        // The preserved range includes the block end and its padding.
        writer.write_raw_words(raw);
    } else {
        let mut abbrevs: Vec<Abbreviation> =
            blockinfo.get(&block.block_id).cloned().unwrap_or_default();
        let mut blockinfo_bid: Option<u64> = None;

        for entry in &block.entries {
            match entry {
                DxilEntry::DefineAbbrev(abbrev) => {
                    writer.write(DEFINE_ABBREV, block.abbrev_width);
                    encode_abbrev_definition(writer, abbrev);

                    if block.block_id == BLOCK_BLOCKINFO {
                        blockinfo
                            .entry(blockinfo_bid.unwrap_or(0))
                            .or_default()
                            .push(abbrev.clone());
                    } else {
                        abbrevs.push(abbrev.clone());
                    }
                }
                DxilEntry::Record(record) => {
                    if block.block_id == BLOCK_BLOCKINFO && record.code == BLOCKINFO_SETBID {
                        blockinfo_bid = record.fields.first().copied();
                    }
                    encode_record(writer, block.abbrev_width, &abbrevs, record)?;
                }
                DxilEntry::Block(child) => {
                    encode_block(writer, child, block.abbrev_width, blockinfo)?;
                }
            }
        }

        writer.write(END_BLOCK, block.abbrev_width);
        writer.align32();
    }

    let length_words = (writer.bit_pos() - body_start) / 32;
    writer.patch_word(length_at, length_words as u32);
    Ok(())
}

fn encode_abbrev_definition(writer: &mut BitstreamWriter, abbrev: &Abbreviation) {
    writer.write_vbr(abbrev.operands.len() as u64, 5);

    for operand in &abbrev.operands {
        match operand {
            AbbrevOperand::Literal(value) => {
                writer.write(1, 1);
                writer.write_vbr(*value, 8);
            }
            AbbrevOperand::Fixed(width) => {
                writer.write(0, 1);
                writer.write(crate::bitstream::ENCODING_FIXED, 3);
                writer.write_vbr(u64::from(*width), 5);
            }
            AbbrevOperand::Vbr(width) => {
                writer.write(0, 1);
                writer.write(crate::bitstream::ENCODING_VBR, 3);
                writer.write_vbr(u64::from(*width), 5);
            }
            AbbrevOperand::Array => {
                writer.write(0, 1);
                writer.write(crate::bitstream::ENCODING_ARRAY, 3);
            }
            AbbrevOperand::Char6 => {
                writer.write(0, 1);
                writer.write(crate::bitstream::ENCODING_CHAR6, 3);
            }
            AbbrevOperand::Blob => {
                writer.write(0, 1);
                writer.write(crate::bitstream::ENCODING_BLOB, 3);
            }
        }
    }
}

fn encode_record(
    writer: &mut BitstreamWriter,
    abbrev_width: u32,
    abbrevs: &[Abbreviation],
    record: &DxilRecord,
) -> Result<()> {
    let Some(abbrev_id) = record.abbrev_id else {
        writer.write(crate::bitstream::UNABBREV_RECORD, abbrev_width);
        writer.write_vbr(record.code, 6);
        writer.write_vbr(record.fields.len() as u64, 6);
        for field in &record.fields {
            writer.write_vbr(*field, 6);
        }
        return Ok(());
    };

    let index = (abbrev_id - FIRST_APPLICATION_ABBREV) as usize;
    let abbrev = abbrevs.get(index).ok_or_else(|| {
        CodecError::EmissionFailed(format!("record references undefined abbreviation {}", abbrev_id))
    })?;

    writer.write(abbrev_id, abbrev_width);

    // Code leads the resolved values; replay them against the template.
    let mut values = Vec::with_capacity(1 + record.fields.len());
    values.push(record.code);
    values.extend_from_slice(&record.fields);
    let mut cursor = 0usize;

    let mut operands = abbrev.operands.iter().peekable();
    while let Some(operand) = operands.next() {
        match operand {
            AbbrevOperand::Literal(value) => {
                if values.get(cursor) != Some(value) {
                    return Err(CodecError::EmissionFailed(format!(
                        "record value diverged from abbreviation literal {}",
                        value
                    )));
                }
                cursor += 1;
            }
            AbbrevOperand::Fixed(width) => {
                writer.write(take_value(&values, &mut cursor)?, *width);
            }
            AbbrevOperand::Vbr(width) => {
                writer.write_vbr(take_value(&values, &mut cursor)?, *width);
            }
            AbbrevOperand::Char6 => {
                writer.write(take_value(&values, &mut cursor)?, 6);
            }
            AbbrevOperand::Array => {
                let element = *operands.next().ok_or_else(|| {
                    CodecError::EmissionFailed("array without element type".to_string())
                })?;

                let count = values.len() - cursor;
                writer.write_vbr(count as u64, 6);
                for _ in 0..count {
                    let value = take_value(&values, &mut cursor)?;
                    match element {
                        AbbrevOperand::Fixed(width) => writer.write(value, width),
                        AbbrevOperand::Vbr(width) => writer.write_vbr(value, width),
                        AbbrevOperand::Char6 => writer.write(value, 6),
                        AbbrevOperand::Literal(_) => {}
                        AbbrevOperand::Array | AbbrevOperand::Blob => {
                            return Err(CodecError::EmissionFailed(
                                "invalid array element encoding".to_string(),
                            ))
                        }
                    }
                }
            }
            AbbrevOperand::Blob => {
                let blob = record.blob.as_deref().ok_or_else(|| {
                    CodecError::EmissionFailed("record lost its blob payload".to_string())
                })?;
                writer.write_blob(blob);
            }
        }
    }

    Ok(())
}

fn take_value(values: &[u64], cursor: &mut usize) -> Result<u64> {
    let value = values.get(*cursor).copied().ok_or_else(|| {
        CodecError::EmissionFailed("record is shorter than its abbreviation".to_string())
    })?;
    *cursor += 1;
    Ok(value)
}
