//! DXBC/DXIL shader container codec.
//!
//! The container is a chunked format: a signed header, a chunk offset
//! table, and `(fourcc, size, bytes)` chunks. The codec recognizes the
//! chunks it rewrites and preserves everything else verbatim on stitch.
//! DXIL payloads scan into a full bitstream entry tree (blockinfo-aware,
//! raw fallback on lost context), rewrite at record granularity, and
//! re-emit through the abbreviation-aware writer; function bodies lift
//! into the shared IL as opaque records for symbolization.

mod bitstream;
mod container;
mod dxil;
mod psv;
mod signer;

pub use bitstream::{
    AbbrevOperand, Abbreviation, BitstreamEntry, BitstreamReader, BitstreamWriter,
};
pub use container::{
    Chunk, ChunkKind, DxbcHeader, DxbcModule, FOURCC_DXIL, FOURCC_PSV0,
    MAGIC as CONTAINER_MAGIC,
};
pub use dxil::{
    DxilBlock, DxilChunk, DxilEntry, DxilProgramHeader, DxilRecord, BITCODE_MAGIC, BLOCK_FUNCTION,
    BLOCK_MODULE, DXIL_MAGIC, PROGRAM_HEADER_SIZE,
};
pub use psv::{BindInfo, BindInfoKind, BindInfoType, PsvBlock, RootRegisterBindingInfo};
pub use signer::{sign_with_bypass, Md5Context, Signer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("shader parsing failed: {0}")]
    ShaderParsingFailed(String),
    #[error("re-emission failed: {0}")]
    EmissionFailed(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

pub type Result<T, E = CodecError> = std::result::Result<T, E>;
