//! Host-driven instrumentation control messages.

use crate::{ids, Message, MessageReader, MessageWriter, Result};

/// Pipeline type selector carried by filters; `None` is the wildcard.
pub type PipelineTypeFilter = Option<u8>;

pub const PIPELINE_TYPE_GRAPHICS: u8 = 0;
pub const PIPELINE_TYPE_COMPUTE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetGlobalInstrumentationMessage {
    pub feature_bit_set: u64,
    /// Feature specialization sub-stream, opaque to the controller.
    pub specialization: Vec<u8>,
}

impl Message for SetGlobalInstrumentationMessage {
    const ID: u32 = ids::SET_GLOBAL_INSTRUMENTATION;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u64(self.feature_bit_set);
        writer.write_bytes(&self.specialization);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            feature_bit_set: reader.read_u64()?,
            specialization: reader.read_bytes()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetShaderInstrumentationMessage {
    pub shader_guid: u64,
    pub feature_bit_set: u64,
    pub specialization: Vec<u8>,
}

impl Message for SetShaderInstrumentationMessage {
    const ID: u32 = ids::SET_SHADER_INSTRUMENTATION;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u64(self.shader_guid);
        writer.write_u64(self.feature_bit_set);
        writer.write_bytes(&self.specialization);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            shader_guid: reader.read_u64()?,
            feature_bit_set: reader.read_u64()?,
            specialization: reader.read_bytes()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPipelineInstrumentationMessage {
    pub pipeline_uid: u64,
    pub feature_bit_set: u64,
    pub specialization: Vec<u8>,
}

impl Message for SetPipelineInstrumentationMessage {
    const ID: u32 = ids::SET_PIPELINE_INSTRUMENTATION;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u64(self.pipeline_uid);
        writer.write_u64(self.feature_bit_set);
        writer.write_bytes(&self.specialization);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            pipeline_uid: reader.read_u64()?,
            feature_bit_set: reader.read_u64()?,
            specialization: reader.read_bytes()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFilterMessage {
    pub guid: String,
    /// Pipeline type constraint; wildcard when absent.
    pub pipeline_type: PipelineTypeFilter,
    /// Debug-name substring constraint; empty matches everything.
    pub name: String,
    pub feature_bit_set: u64,
    pub specialization: Vec<u8>,
}

impl Message for AddFilterMessage {
    const ID: u32 = ids::ADD_FILTER;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_string(&self.guid);
        match self.pipeline_type {
            Some(pipeline_type) => {
                writer.write_u8(1);
                writer.write_u8(pipeline_type);
            }
            None => writer.write_u8(0),
        }
        writer.write_string(&self.name);
        writer.write_u64(self.feature_bit_set);
        writer.write_bytes(&self.specialization);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let guid = reader.read_string()?;
        let pipeline_type = if reader.read_u8()? != 0 {
            Some(reader.read_u8()?)
        } else {
            None
        };
        Ok(Self {
            guid,
            pipeline_type,
            name: reader.read_string()?,
            feature_bit_set: reader.read_u64()?,
            specialization: reader.read_bytes()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetStateMessage {}

impl Message for GetStateMessage {
    const ID: u32 = ids::GET_STATE;

    fn encode(&self, _writer: &mut MessageWriter) {}

    fn decode(_reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {})
    }
}

/// Controller's answer to [`GetStateMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationStateMessage {
    pub global_feature_bit_set: u64,
    pub shader_overrides: u32,
    pub pipeline_overrides: u32,
    pub filters: u32,
}

impl Message for InstrumentationStateMessage {
    const ID: u32 = ids::INSTRUMENTATION_STATE;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u64(self.global_feature_bit_set);
        writer.write_u32(self.shader_overrides);
        writer.write_u32(self.pipeline_overrides);
        writer.write_u32(self.filters);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            global_feature_bit_set: reader.read_u64()?,
            shader_overrides: reader.read_u32()?,
            pipeline_overrides: reader.read_u32()?,
            filters: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_roundtrip() {
        let message = AddFilterMessage {
            guid: "f-1".to_string(),
            pipeline_type: Some(PIPELINE_TYPE_COMPUTE),
            name: "Blur".to_string(),
            feature_bit_set: 0x02,
            specialization: vec![1, 2, 3],
        };

        let mut writer = MessageWriter::new();
        message.encode(&mut writer);
        let bytes = writer.into_bytes();

        let decoded = AddFilterMessage::decode(&mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wildcard_filter_roundtrip() {
        let message = AddFilterMessage {
            guid: "f-2".to_string(),
            pipeline_type: None,
            name: String::new(),
            feature_bit_set: 0x01,
            specialization: Vec::new(),
        };

        let mut writer = MessageWriter::new();
        message.encode(&mut writer);

        let bytes = writer.into_bytes();
        let decoded = AddFilterMessage::decode(&mut MessageReader::new(&bytes)).unwrap();
        assert_eq!(decoded.pipeline_type, None);
        assert!(decoded.name.is_empty());
    }
}
