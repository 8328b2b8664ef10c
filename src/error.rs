// Error types for the rendering core
//
// Every GPU-facing operation returns `Result<T, RenderError>`. Nothing in the
// core asserts or aborts: the caller decides whether an error ends the frame
// loop (it always does today; there is no retry path).

use crate::gpu::{AccelerationLevel, ImageId, ResourceState};
use crate::sync::FenceValue;

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Failed to wait for fence value {value}: {reason}")]
    FenceWait { value: FenceValue, reason: String },

    #[error("Descriptor heap `{heap}` exhausted: {requested} requested, {remaining} of {capacity} left")]
    DescriptorHeapExhausted {
        heap: String,
        capacity: u32,
        remaining: u32,
        requested: u32,
    },

    #[error("Invalid descriptor heap `{heap}`: {reason}")]
    InvalidDescriptorHeap { heap: String, reason: &'static str },

    #[error("Resource `{name}` is in state {actual:?}, expected {expected:?}")]
    InvalidResourceState {
        name: String,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("Buffer `{name}` requested with zero size")]
    ZeroSizedBuffer { name: String },

    #[error("Buffer `{name}` is not CPU writable")]
    NotCpuWritable { name: String },

    #[error("Write of {len} bytes at offset {offset} overflows buffer `{name}` ({size} bytes)")]
    BufferOverflow {
        name: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("`{operation}` called while the frame is {phase}")]
    InvalidFramePhase {
        operation: &'static str,
        phase: &'static str,
    },

    #[error("`{command}` recorded while no command list is open")]
    NotRecording { command: &'static str },

    #[error("Image {image:?} is not available: {reason}")]
    ImageUnavailable { image: ImageId, reason: &'static str },

    #[error("{what} count {count} does not fit in {bits} bits")]
    CountOverflow {
        what: &'static str,
        count: usize,
        bits: u32,
    },

    #[error("Unknown model id {0}")]
    UnknownModel(u32),

    #[error("Model {model} has no bottom-level acceleration structure")]
    MissingBottomLevel { model: u32 },

    #[error("{level:?}-level build declared {declared} instances but {provided} were provided")]
    InstanceCountMismatch {
        level: AccelerationLevel,
        declared: u32,
        provided: u32,
    },

    #[error("Refit needs an updatable top-level structure with {expected} instances, scene has {actual}")]
    RefitTopologyMismatch { expected: u32, actual: u32 },

    #[error("Mesh `{name}` is invalid: {reason}")]
    InvalidMesh { name: String, reason: &'static str },

    #[error("Presentation surface is out of date")]
    SurfaceOutOfDate,

    #[error("Device lacks required support: {0}")]
    Unsupported(String),
}
