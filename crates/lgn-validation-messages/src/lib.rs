//! Message streams and their hand-written schemas.
//!
//! A stream is a typed blob `(schema, version, count, bytes)`. Typed
//! streams hold one message kind back to back; ordered streams interleave
//! kinds behind per-message framing and preserve append order end to end.

mod codec;
pub mod diagnostic;
pub mod discovery;
pub mod instrumentation;
mod stream;

pub use codec::{MessageReader, MessageWriter};
pub use stream::{Message, MessageSchema, MessageSchemaKind, MessageStream, OrderedMessageRef};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message stream truncated at byte {0}")]
    Truncated(usize),
    #[error("message id {found} does not match the stream schema {expected}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("invalid string payload")]
    InvalidString,
}

pub type Result<T, E = MessageError> = std::result::Result<T, E>;

/// Message id space. Host-bound and layer-bound ids share one registry so
/// ordered streams stay unambiguous.
pub mod ids {
    pub const HOST_CONNECTED: u32 = 1;
    pub const HOST_RESOLVED: u32 = 2;
    pub const HOST_SERVER_INFO: u32 = 3;
    pub const HOST_DISCOVERY: u32 = 4;
    pub const DISCOVERY_REQUEST: u32 = 5;
    pub const CLIENT_REQUEST: u32 = 6;

    pub const SET_GLOBAL_INSTRUMENTATION: u32 = 16;
    pub const SET_SHADER_INSTRUMENTATION: u32 = 17;
    pub const SET_PIPELINE_INSTRUMENTATION: u32 = 18;
    pub const ADD_FILTER: u32 = 19;
    pub const GET_STATE: u32 = 20;
    pub const INSTRUMENTATION_STATE: u32 = 21;

    pub const UNSTABLE_EXPORT: u32 = 32;
    pub const SHADER_SOURCE_MAPPING: u32 = 33;
    pub const RESOURCE_VERSION: u32 = 34;
    pub const VERSION_SUMMARIZATION: u32 = 35;
    pub const VERSION_BRANCH: u32 = 36;
    pub const VERSION_COLLAPSE: u32 = 37;
}
