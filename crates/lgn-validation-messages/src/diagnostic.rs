//! Layer-to-host diagnostic messages: feature export records, source
//! mappings, and resource versioning events.

use crate::{ids, Message, MessageReader, MessageWriter, Result};

/// A floating-point export that evaluated to inf or NaN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstableExportMessage {
    pub sguid: u32,
    pub is_nan: u32,
    /// Packed resource token of the written resource, when detailed
    /// instrumentation was enabled.
    pub detail_token: Option<u32>,
}

impl UnstableExportMessage {
    /// Dword arity of the record as the shader exports it: sguid, is_nan,
    /// detail flag, detail token. Fixed so records pack back to back in
    /// the stream buffer.
    pub const EXPORT_DWORD_COUNT: u32 = 4;
}

impl Message for UnstableExportMessage {
    const ID: u32 = ids::UNSTABLE_EXPORT;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u32(self.sguid);
        writer.write_u32(self.is_nan);
        writer.write_u32(u32::from(self.detail_token.is_some()));
        writer.write_u32(self.detail_token.unwrap_or(0));
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let sguid = reader.read_u32()?;
        let is_nan = reader.read_u32()?;
        let has_detail = reader.read_u32()? != 0;
        let token = reader.read_u32()?;
        Ok(Self {
            sguid,
            is_nan,
            detail_token: has_detail.then_some(token),
        })
    }
}

/// Source association of a newly observed SGUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSourceMappingMessage {
    pub sguid: u32,
    pub shader_guid: u64,
    pub file_uid: u32,
    pub line: u32,
    pub column: u32,
    pub basic_block_id: u32,
    pub instruction_index: u32,
    pub contents: String,
}

impl Message for ShaderSourceMappingMessage {
    const ID: u32 = ids::SHADER_SOURCE_MAPPING;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u32(self.sguid);
        writer.write_u64(self.shader_guid);
        writer.write_u32(self.file_uid);
        writer.write_u32(self.line);
        writer.write_u32(self.column);
        writer.write_u32(self.basic_block_id);
        writer.write_u32(self.instruction_index);
        writer.write_string(&self.contents);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            sguid: reader.read_u32()?,
            shader_guid: reader.read_u64()?,
            file_uid: reader.read_u32()?,
            line: reader.read_u32()?,
            column: reader.read_u32()?,
            basic_block_id: reader.read_u32()?,
            instruction_index: reader.read_u32()?,
            contents: reader.read_string()?,
        })
    }
}

/// A resource's state at a version head. A version of `u32::MAX` marks
/// destruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceVersionMessage {
    pub puid: u32,
    pub version: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: String,
}

impl ResourceVersionMessage {
    pub const VERSION_DESTROYED: u32 = u32::MAX;
}

impl Message for ResourceVersionMessage {
    const ID: u32 = ids::RESOURCE_VERSION;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u32(self.puid);
        writer.write_u32(self.version);
        writer.write_string(&self.name);
        writer.write_u32(self.width);
        writer.write_u32(self.height);
        writer.write_u32(self.depth);
        writer.write_string(&self.format);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            puid: reader.read_u32()?,
            version: reader.read_u32()?,
            name: reader.read_string()?,
            width: reader.read_u32()?,
            height: reader.read_u32()?,
            depth: reader.read_u32()?,
            format: reader.read_string()?,
        })
    }
}

macro_rules! head_message {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub head: u32,
        }

        impl Message for $name {
            const ID: u32 = $id;

            fn encode(&self, writer: &mut MessageWriter) {
                writer.write_u32(self.head);
            }

            fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
                Ok(Self {
                    head: reader.read_u32()?,
                })
            }
        }
    };
}

head_message!(VersionSummarizationMessage, ids::VERSION_SUMMARIZATION);
head_message!(VersionBranchMessage, ids::VERSION_BRANCH);
head_message!(VersionCollapseMessage, ids::VERSION_COLLAPSE);
