//! The layer context.
//!
//! One explicit value owns every subsystem: the mapping tables, the texel
//! allocator, the export streamer, the compiler pools, and the
//! controllers. API entry points thread it through rather than reaching
//! for process globals.

mod context;
mod resource;

pub use context::{LayerContext, LayerError};
pub use resource::{ResourceDesc, ResourceState};

pub type Result<T, E = LayerError> = std::result::Result<T, E>;
