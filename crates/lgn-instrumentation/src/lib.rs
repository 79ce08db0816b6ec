//! Instrumentation control plane.
//!
//! The controller listens to the bridge for feature-set changes, drives
//! the resulting recompilation wave through the compiler pools, and swaps
//! instrumented pipelines live atomically. Alongside it live the
//! versioning controller that narrates resource lifetimes to the
//! inspector, the SGUID host that symbolizes shader-side diagnostics, and
//! the unstable-export feature injector.

mod controller;
mod sguid;
mod state;
mod unstable_export;
mod versioning;

pub use controller::{
    FilterEntry, InstrumentationController, InstrumentationInfo, InstrumentationStage,
    LayerInstrumenter,
};
pub use sguid::{ShaderSguidHost, ShaderSourceMapping, INVALID_SGUID, SGUID_BIT_COUNT};
pub use state::{PipelineState, ShaderState};
pub use unstable_export::UnstableExportFeature;
pub use versioning::{ResourceVersionInfo, VersionSegmentationPoint, VersioningController};
