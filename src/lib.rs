// =============================================================================
// RT RENDERER - Frame pipelining and ray-tracing acceleration structures
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (Begin / Submit / End, N frame slots)                 │
// │    ├── FrameFence (timeline counter, per-slot values)           │
// │    ├── DescriptorHeaps (persistent + per-frame arenas)          │
// │    └── Scene                                                    │
// │          ├── Models (placed vertex/index buffers)               │
// │          └── AccelerationStructureBuilder (BLAS/model,TLAS/slot)│
// │                                                                 │
// │  gpu traits ── backend::VulkanContext (ash + gpu-allocator)     │
// └─────────────────────────────────────────────────────────────────┘
//
// Everything above the `gpu` traits is backend independent and unit tested
// against a recording mock context.
// =============================================================================

pub mod accel;
pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod profiler;
pub mod renderer;
pub mod resource;
pub mod scene;
pub mod sync;

#[cfg(test)]
mod mock;

pub use accel::{AccelerationOptions, AccelerationStructureBuilder, AccelerationUpdate, InstanceDesc};
pub use config::Config;
pub use error::{RenderError, Result};
pub use renderer::{FrameView, Renderer, RendererDesc};
pub use scene::{MeshData, ModelId, Motion, ObjectId, Placement, Scene, Vertex};
pub use sync::{FenceTimeline, FenceValue, FrameFence};
