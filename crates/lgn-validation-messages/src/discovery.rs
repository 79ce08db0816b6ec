//! Discovery handshake messages.

use crate::{ids, Message, MessageReader, MessageWriter, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConnectedMessage {
    pub accepted: bool,
}

impl Message for HostConnectedMessage {
    const ID: u32 = ids::HOST_CONNECTED;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u8(u8::from(self.accepted));
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            accepted: reader.read_u8()? != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResolvedMessage {
    pub accepted: bool,
}

impl Message for HostResolvedMessage {
    const ID: u32 = ids::HOST_RESOLVED;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u8(u8::from(self.accepted));
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            accepted: reader.read_u8()? != 0,
        })
    }
}

/// One discoverable host: its tokens and process identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostServerInfoMessage {
    pub guid: String,
    pub reserved_guid: String,
    pub process: String,
    pub application: String,
    pub api: String,
    pub process_id: u32,
    pub device_uid: u32,
    pub device_objects: u32,
}

impl Message for HostServerInfoMessage {
    const ID: u32 = ids::HOST_SERVER_INFO;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_string(&self.guid);
        writer.write_string(&self.reserved_guid);
        writer.write_string(&self.process);
        writer.write_string(&self.application);
        writer.write_string(&self.api);
        writer.write_u32(self.process_id);
        writer.write_u32(self.device_uid);
        writer.write_u32(self.device_objects);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            guid: reader.read_string()?,
            reserved_guid: reader.read_string()?,
            process: reader.read_string()?,
            application: reader.read_string()?,
            api: reader.read_string()?,
            process_id: reader.read_u32()?,
            device_uid: reader.read_u32()?,
            device_objects: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDiscoveryMessage {
    pub infos: Vec<HostServerInfoMessage>,
}

impl Message for HostDiscoveryMessage {
    const ID: u32 = ids::HOST_DISCOVERY;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_u32(self.infos.len() as u32);
        for info in &self.infos {
            info.encode(writer);
        }
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let count = reader.read_u32()?;
        let mut infos = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            infos.push(HostServerInfoMessage::decode(reader)?);
        }
        Ok(Self { infos })
    }
}

/// Client request for the server's host-info entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryRequestMessage {}

impl Message for DiscoveryRequestMessage {
    const ID: u32 = ids::DISCOVERY_REQUEST;

    fn encode(&self, _writer: &mut MessageWriter) {}

    fn decode(_reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {})
    }
}

/// Client request to attach to the host behind `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestMessage {
    pub token: String,
}

impl Message for ClientRequestMessage {
    const ID: u32 = ids::CLIENT_REQUEST;

    fn encode(&self, writer: &mut MessageWriter) {
        writer.write_string(&self.token);
    }

    fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            token: reader.read_string()?,
        })
    }
}
