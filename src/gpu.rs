// GPU abstraction seam
//
// The frame engine, allocator, descriptor arenas and acceleration-structure
// builder only talk to the GPU through the traits below. The Vulkan backend
// implements them for real hardware; tests implement them with a recorder.
//
//   ResourceDevice ──┬── DescriptorDevice ──┐
//                    └── AccelerationDevice ─┴── CommandRecorder
//   CommandQueue, PresentationSurface (independent)
//
// All recording methods take `&self`: exactly one command list is open at a
// time and it is owned by whoever drives the frame.

use crate::error::Result;
use crate::sync::FenceTimeline;
use glam::Mat4;

/// GPU virtual address of a buffer or acceleration structure.
pub type GpuAddress = u64;

// =============================================================================
// RESOURCES
// =============================================================================

/// Memory heap a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// CPU-writable, GPU-readable
    Upload,
    /// GPU-local, filled by copies or GPU writes
    Default,
}

/// Logical usage state of a resource. Transitions are explicit and recorded
/// as barriers by the command recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    CopySource,
    GenericRead,
    ShaderResource,
    UnorderedAccess,
    AccelerationStructure,
    RenderTarget,
    DepthWrite,
    Present,
}

bitflags::bitflags! {
    /// Buffer usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const ACCELERATION_STRUCTURE = 1 << 4;
        /// Read by acceleration-structure builds (instance descriptors)
        const BUILD_INPUT = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub heap: HeapType,
    pub initial_state: ResourceState,
    pub usage: BufferUsage,
}

pub trait GpuBuffer {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn heap(&self) -> HeapType;
    fn gpu_address(&self) -> GpuAddress;
}

/// Render targets owned by the presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageId {
    BackBuffer(usize),
    Depth,
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Constant buffer / shader resource / unordered access views
    CbvSrvUav,
    RenderTarget,
    DepthStencil,
}

/// Slot index inside one descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u32);

impl DescriptorHandle {
    pub fn index(self) -> u32 {
        self.0
    }

    /// Handle `count` slots further into the same heap.
    pub fn offset(self, count: u32) -> Self {
        Self(self.0 + count)
    }
}

// =============================================================================
// ACCELERATION STRUCTURES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationLevel {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BuildPreference {
    #[default]
    FastTrace,
    FastBuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildFlags {
    pub preference: BuildPreference,
    pub allow_update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    /// Update in place from `source`; topology must match the original build
    Update,
}

/// Opaque indexed triangle list. Positions are three 32-bit floats at the
/// start of each vertex; indices are 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: GpuAddress,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub index_address: GpuAddress,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationGeometry {
    Triangles(TriangleGeometry),
    Instances {
        instance_address: GpuAddress,
        count: u32,
    },
}

impl AccelerationGeometry {
    pub fn level(&self) -> AccelerationLevel {
        match self {
            Self::Triangles(_) => AccelerationLevel::Bottom,
            Self::Instances { .. } => AccelerationLevel::Top,
        }
    }

    /// Triangles for a bottom-level input, instances for a top-level one.
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.index_count / 3,
            Self::Instances { count, .. } => *count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationBuildInputs {
    pub geometry: AccelerationGeometry,
    pub flags: BuildFlags,
}

/// Memory needed to build an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

pub trait AccelerationObject {
    fn level(&self) -> AccelerationLevel;
    fn gpu_address(&self) -> GpuAddress;
    fn result_size(&self) -> u64;
}

pub struct AccelerationBuild<'a, A, B> {
    pub inputs: AccelerationBuildInputs,
    pub mode: BuildMode,
    pub destination: &'a A,
    pub source: Option<&'a A>,
    pub scratch: &'a B,
}

// =============================================================================
// FRAME RECORDING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

pub struct PassDesc<'a, H> {
    pub target: ImageId,
    pub rtv_heap: &'a H,
    pub rtv: DescriptorHandle,
    pub dsv_heap: &'a H,
    pub dsv: DescriptorHandle,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub viewport: Viewport,
}

/// Frame-wide bindings set once after the pass begins.
pub struct FrameBindings<'a, H> {
    pub descriptor_heap: &'a H,
    pub viewport: Viewport,
    pub view_projection: Mat4,
    /// Zero when the scene has no top-level structure yet
    pub tlas_address: GpuAddress,
}

pub struct DrawIndexed<'a, B> {
    pub vertex_buffer: &'a B,
    pub vertex_stride: u64,
    pub index_buffer: &'a B,
    pub index_count: u32,
    /// Shader-visible slot of the instance's transform constant buffer
    pub transform_view: DescriptorHandle,
}

/// Whether a submission consumes the acquired back buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Frame,
    Immediate,
}

// =============================================================================
// TRAITS
// =============================================================================

pub trait ResourceDevice {
    type Buffer: GpuBuffer;

    /// Buffer with its own allocation.
    fn create_committed_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer>;

    /// Buffers sub-allocated from one shared allocation, in order.
    fn create_placed_buffers(&self, descs: &[BufferDesc<'_>]) -> Result<Vec<Self::Buffer>>;

    /// CPU write into an upload-heap buffer.
    fn write_buffer(&self, buffer: &mut Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Granularity buffer sizes are rounded up to.
    fn placement_alignment(&self) -> u64;
}

pub trait DescriptorDevice: ResourceDevice {
    type DescriptorHeap;

    fn create_descriptor_heap(
        &self,
        name: &str,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap>;

    fn write_constant_buffer_view(
        &self,
        heap: &Self::DescriptorHeap,
        slot: DescriptorHandle,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<()>;

    fn write_render_target_view(
        &self,
        heap: &Self::DescriptorHeap,
        slot: DescriptorHandle,
        image: ImageId,
    ) -> Result<()>;

    fn write_depth_stencil_view(
        &self,
        heap: &Self::DescriptorHeap,
        slot: DescriptorHandle,
        image: ImageId,
    ) -> Result<()>;
}

pub trait AccelerationDevice: ResourceDevice {
    type AccelerationStructure: AccelerationObject;

    fn acceleration_build_sizes(&self, inputs: &AccelerationBuildInputs) -> Result<BuildSizes>;

    /// Wrap `result` (default heap, acceleration-structure state) as a
    /// structure of the given level. The structure owns the buffer.
    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        result: Self::Buffer,
    ) -> Result<Self::AccelerationStructure>;
}

/// Every method fails with `RenderError::NotRecording` when no command list
/// is open, so callers only update tracked state once a command was recorded.
pub trait CommandRecorder: DescriptorDevice + AccelerationDevice {
    fn cmd_copy_buffer(
        &self,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    fn cmd_transition_buffer(&self, buffer: &Self::Buffer, before: ResourceState, after: ResourceState) -> Result<()>;

    fn cmd_transition_image(&self, image: ImageId, before: ResourceState, after: ResourceState) -> Result<()>;

    /// Orders acceleration-structure writes before any later read.
    fn cmd_uav_barrier(&self, structures: &[&Self::AccelerationStructure]) -> Result<()>;

    fn cmd_build_acceleration_structure(
        &self,
        build: &AccelerationBuild<'_, Self::AccelerationStructure, Self::Buffer>,
    ) -> Result<()>;

    fn cmd_begin_pass(&self, pass: &PassDesc<'_, Self::DescriptorHeap>) -> Result<()>;

    fn cmd_end_pass(&self) -> Result<()>;

    fn cmd_bind_frame(&self, bindings: &FrameBindings<'_, Self::DescriptorHeap>) -> Result<()>;

    fn cmd_draw_indexed(&self, draw: &DrawIndexed<'_, Self::Buffer>) -> Result<()>;
}

pub trait CommandQueue {
    type Timeline: FenceTimeline;

    /// Number of frame slots (command allocators / back buffers).
    fn frame_count(&self) -> usize;

    fn create_timeline(&self) -> Result<Self::Timeline>;

    /// Reset the slot's allocator and open the command list on it.
    fn reset_command_list(&self, frame_slot: usize) -> Result<()>;

    fn close_command_list(&self) -> Result<()>;

    fn execute_command_list(&self, submission: Submission) -> Result<()>;
}

pub trait PresentationSurface {
    fn back_buffer_count(&self) -> usize;

    fn current_back_buffer_index(&self) -> usize;

    fn dimensions(&self) -> Viewport;

    fn create_depth_buffer(&self, viewport: Viewport) -> Result<()>;

    /// Present the current back buffer and advance to the next one.
    fn present(&self) -> Result<()>;
}

/// Everything the frame orchestrator needs from a device.
pub trait GraphicsContext: CommandRecorder + CommandQueue + PresentationSurface {}

impl<T> GraphicsContext for T where T: CommandRecorder + CommandQueue + PresentationSurface {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_usage_combines_flags() {
        let usage = BufferUsage::UNORDERED_ACCESS | BufferUsage::ACCELERATION_STRUCTURE;
        assert!(usage.contains(BufferUsage::UNORDERED_ACCESS));
        assert!(usage.contains(BufferUsage::ACCELERATION_STRUCTURE));
        assert!(!usage.contains(BufferUsage::VERTEX));
        assert!(usage.contains(BufferUsage::empty()));
        assert_eq!(BufferUsage::default(), BufferUsage::empty());
    }

    #[test]
    fn geometry_primitive_counts() {
        let tris = AccelerationGeometry::Triangles(TriangleGeometry {
            vertex_address: 0x1000,
            vertex_count: 4,
            vertex_stride: 40,
            index_address: 0x2000,
            index_count: 6,
        });
        assert_eq!(tris.primitive_count(), 2);
        assert_eq!(tris.level(), AccelerationLevel::Bottom);

        let instances = AccelerationGeometry::Instances { instance_address: 0x3000, count: 7 };
        assert_eq!(instances.primitive_count(), 7);
        assert_eq!(instances.level(), AccelerationLevel::Top);
    }
}
