//! Bridge transports.
//!
//! The memory bridge moves streams between in-process producers and
//! listeners; the remote client bridge frames them over TCP towards the
//! out-of-process inspector. Network IO runs on the bridge's own runtime
//! threads, never on application threads.

mod listener;
mod memory;
pub mod protocol;
mod remote;

pub use listener::{BridgeListener, ListenerRegistry};
pub use memory::{BridgeInfo, MemoryBridge};
pub use remote::{EndpointResolve, RemoteClientBridge};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing violation: {0}")]
    Framing(String),
    #[error("bridge is not connected")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
