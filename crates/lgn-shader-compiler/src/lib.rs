//! Shader and pipeline compilation off the application thread.
//!
//! Two worker pools of identical shape chunk batched jobs, deduplicate by
//! instrumentation key, and signal completion through a functor invoked by
//! the last worker of a batch. Compiled shaders recycle through an on-disk
//! cache keyed by feature version and byte content.

mod cache;
mod hash;
mod key;
mod pipeline_compiler;
mod pool;
mod shader_compiler;

pub use cache::ShaderCache;
pub use hash::{combine_hash, content_hash};
pub use key::ShaderInstrumentationKey;
pub use pipeline_compiler::{PipelineCompiler, PipelineDesc, PipelineJob};
pub use pool::{BatchCompletion, CompilerDiagnostic, CompilerPool, CHUNKED_SEGMENTATION_FACTOR};
pub use shader_compiler::{ShaderCompiler, ShaderInstrumenter, ShaderJob, ShaderSource};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("shader parsing failed: {0}")]
    Parse(String),
    #[error("instrumentation failed: {0}")]
    Instrumentation(String),
    #[error("driver rejected the compiled object: {0}")]
    Driver(String),
    #[error("a sibling compile of the same instrumentation key failed")]
    SharedKeyFailed,
}

impl From<lgn_spirv::CodecError> for CompileError {
    fn from(error: lgn_spirv::CodecError) -> Self {
        match error {
            lgn_spirv::CodecError::ShaderParsingFailed(message) => Self::Parse(message),
            other => Self::Instrumentation(other.to_string()),
        }
    }
}

impl From<lgn_dxbc::CodecError> for CompileError {
    fn from(error: lgn_dxbc::CodecError) -> Self {
        match error {
            lgn_dxbc::CodecError::ShaderParsingFailed(message) => Self::Parse(message),
            other => Self::Instrumentation(other.to_string()),
        }
    }
}

impl From<lgn_gpu_api::GpuError> for CompileError {
    fn from(error: lgn_gpu_api::GpuError) -> Self {
        Self::Driver(error.to_string())
    }
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;
