//! SPIR-V shader binary codec.
//!
//! A [`SpirvModule`] scans the physical word stream on parse, builds the
//! shared IL lazily on the first transformation request, and re-emits either
//! the original bytes (clean program, round-trip identity) or a stitched
//! stream with injected instructions lowered back to physical form.

mod builder;
mod module;
pub mod spec;
mod writer;

pub use module::{RawInstruction, SpirvHeader, SpirvModule};
pub use writer::InjectionBindings;

use thiserror::Error;

/// Codec failures. Parse failures mark the shader un-instrumentable; the
/// original driver object stays live.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("shader parsing failed: {0}")]
    ShaderParsingFailed(String),
    #[error("re-emission failed: {0}")]
    EmissionFailed(String),
    #[error("injected instruction cannot be lowered to SPIR-V: {0}")]
    UnsupportedInjection(&'static str),
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;
