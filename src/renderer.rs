// =============================================================================
// FRAME ORCHESTRATOR
// =============================================================================
//
// Drives one frame at a time through Begin -> Submit -> End on any
// `GraphicsContext`. N frame slots (one per back buffer) each own a command
// allocator, a transient descriptor arena and a transform ring buffer. A slot
// is reused only after the fence value recorded for its last submission has
// been reached.
//
// FRAME FLOW:
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ begin:  reset slot ─> update AS ─> present→RT ─> clear ─> bind TLAS       │
// │ submit: per object: write constants ─> transient CBV ─> draw             │
// │ end:    RT→present ─> close ─> execute ─> signal ─> present ─> wait slot │
// └──────────────────────────────────────────────────────────────────────────┘

use crate::descriptor::{DescriptorHeap, DescriptorHeapDesc};
use crate::error::{RenderError, Result};
use crate::gpu::{
    BufferDesc, BufferUsage, DescriptorHandle, DescriptorKind, DrawIndexed, FrameBindings, GraphicsContext,
    HeapType, ImageId, PassDesc, ResourceState, Submission, Viewport,
};
use crate::profiler::Profiler;
use crate::resource::{create_buffer, write_buffer, Resource};
use crate::scene::Scene;
use crate::sync::{FenceValue, FrameFence, FrameSlots};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Constant-buffer views must start on this boundary.
pub const TRANSFORM_STRIDE: u64 = 256;

/// Per-object constants at the start of each transform ring slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectConstants {
    pub model: [f32; 16],
    pub tint: [f32; 4],
}

#[derive(Debug, Clone)]
pub struct RendererDesc {
    pub clear_color: [f32; 4],
    pub persistent_descriptors: u32,
    /// Upper bound on objects drawn per frame
    pub transient_descriptors_per_frame: u32,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            persistent_descriptors: 64,
            transient_descriptors_per_frame: 1024,
        }
    }
}

/// Per-frame camera input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameView {
    pub view_projection: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
}

impl FramePhase {
    fn name(self) -> &'static str {
        match self {
            FramePhase::Idle => "idle",
            FramePhase::Recording => "recording",
        }
    }
}

pub struct Renderer<C: GraphicsContext> {
    fence: FrameFence<C::Timeline>,
    frame_values: FrameSlots,
    current_slot: usize,
    phase: FramePhase,

    rtv_heap: DescriptorHeap<C::DescriptorHeap>,
    rtvs: Vec<DescriptorHandle>,
    dsv_heap: DescriptorHeap<C::DescriptorHeap>,
    dsv: DescriptorHandle,
    shader_heap: DescriptorHeap<C::DescriptorHeap>,
    transform_rings: Vec<Resource<C::Buffer>>,

    back_buffer_states: Vec<ResourceState>,
    depth_state: ResourceState,
    viewport: Viewport,
    clear_color: [f32; 4],

    frames_rendered: u64,
    profiler: Profiler,
}

impl<C: GraphicsContext> Renderer<C> {
    /// Create per-slot resources, the depth buffer and the descriptor heaps.
    pub fn new(ctx: &C, desc: &RendererDesc) -> Result<Self> {
        let frame_count = ctx.frame_count();
        if frame_count != ctx.back_buffer_count() {
            return Err(RenderError::Unsupported(format!(
                "{} frame slots for {} back buffers",
                frame_count,
                ctx.back_buffer_count()
            )));
        }
        log::info!("Creating renderer with {} frame slots", frame_count);

        let fence = FrameFence::new(ctx.create_timeline()?);
        let viewport = ctx.dimensions();
        ctx.create_depth_buffer(viewport)?;

        // ─────────────────────────────────────────────────────────────────────
        // Render target and depth views
        // ─────────────────────────────────────────────────────────────────────
        let mut rtv_heap = DescriptorHeap::new(
            ctx,
            &DescriptorHeapDesc {
                name: "render targets",
                kind: DescriptorKind::RenderTarget,
                persistent_capacity: frame_count as u32,
                transient_capacity: 0,
                frame_count,
                shader_visible: false,
            },
        )?;
        let mut rtvs = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            let handle = rtv_heap.allocate()?;
            ctx.write_render_target_view(rtv_heap.raw(), handle, ImageId::BackBuffer(i))?;
            rtvs.push(handle);
        }

        let mut dsv_heap = DescriptorHeap::new(
            ctx,
            &DescriptorHeapDesc {
                name: "depth stencil",
                kind: DescriptorKind::DepthStencil,
                persistent_capacity: 1,
                transient_capacity: 0,
                frame_count,
                shader_visible: false,
            },
        )?;
        let dsv = dsv_heap.allocate()?;
        ctx.write_depth_stencil_view(dsv_heap.raw(), dsv, ImageId::Depth)?;

        // ─────────────────────────────────────────────────────────────────────
        // Shader-visible heap + one transform ring per frame slot
        // ─────────────────────────────────────────────────────────────────────
        let shader_heap = DescriptorHeap::new(
            ctx,
            &DescriptorHeapDesc {
                name: "shader resources",
                kind: DescriptorKind::CbvSrvUav,
                persistent_capacity: desc.persistent_descriptors,
                transient_capacity: desc.transient_descriptors_per_frame,
                frame_count,
                shader_visible: true,
            },
        )?;

        let transform_rings = (0..frame_count)
            .map(|i| {
                let name = format!("transforms (frame {i})");
                create_buffer(
                    ctx,
                    &BufferDesc {
                        name: &name,
                        size: TRANSFORM_STRIDE * u64::from(desc.transient_descriptors_per_frame.max(1)),
                        heap: HeapType::Upload,
                        initial_state: ResourceState::GenericRead,
                        usage: BufferUsage::CONSTANT,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fence,
            frame_values: FrameSlots::new(frame_count),
            current_slot: ctx.current_back_buffer_index(),
            phase: FramePhase::Idle,
            rtv_heap,
            rtvs,
            dsv_heap,
            dsv,
            shader_heap,
            transform_rings,
            back_buffer_states: vec![ResourceState::Present; frame_count],
            depth_state: ResourceState::Common,
            viewport,
            clear_color: desc.clear_color,
            frames_rendered: 0,
            profiler: Profiler::new(),
        })
    }

    fn expect_phase(&self, expected: FramePhase, operation: &'static str) -> Result<()> {
        if self.phase != expected {
            return Err(RenderError::InvalidFramePhase {
                operation,
                phase: self.phase.name(),
            });
        }
        Ok(())
    }

    /// Block until the slot about to be reset has finished on the GPU.
    fn claim_slot(&self, slot: usize) -> Result<()> {
        self.fence.wait_for_fence_value(self.frame_values.value(slot))
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Open the frame: reset the slot, refresh acceleration structures, clear
    /// the back buffer and bind frame-wide state.
    pub fn begin(&mut self, ctx: &C, scene: &mut Scene<C>, view: &FrameView) -> Result<()> {
        self.expect_phase(FramePhase::Idle, "begin")?;
        let _scope = self.profiler.scope("Renderer::begin");
        let slot = self.current_slot;

        self.claim_slot(slot)?;
        ctx.reset_command_list(slot)?;
        self.shader_heap.reset_transient(slot);
        self.phase = FramePhase::Recording;

        scene.collect_garbage(self.fence.completed_value()?);
        {
            let _scope = self.profiler.scope("Scene::update_acceleration_structures");
            scene.update_acceleration_structures(ctx, &self.fence, slot)?;
        }

        let target = ImageId::BackBuffer(slot);
        ctx.cmd_transition_image(target, self.back_buffer_states[slot], ResourceState::RenderTarget)?;
        self.back_buffer_states[slot] = ResourceState::RenderTarget;
        if self.depth_state != ResourceState::DepthWrite {
            ctx.cmd_transition_image(ImageId::Depth, self.depth_state, ResourceState::DepthWrite)?;
            self.depth_state = ResourceState::DepthWrite;
        }

        ctx.cmd_begin_pass(&PassDesc {
            target,
            rtv_heap: self.rtv_heap.raw(),
            rtv: self.rtvs[slot],
            dsv_heap: self.dsv_heap.raw(),
            dsv: self.dsv,
            clear_color: self.clear_color,
            clear_depth: 1.0,
            viewport: self.viewport,
        })?;
        ctx.cmd_bind_frame(&FrameBindings {
            descriptor_heap: self.shader_heap.raw(),
            viewport: self.viewport,
            view_projection: view.view_projection,
            tlas_address: scene.acceleration_structure_address().unwrap_or(0),
        })?;
        Ok(())
    }

    /// Record a draw for every object in the scene. Returns the draw count.
    pub fn submit(&mut self, ctx: &C, scene: &Scene<C>) -> Result<u32> {
        self.expect_phase(FramePhase::Recording, "submit")?;
        let _scope = self.profiler.scope("Renderer::submit");
        let slot = self.current_slot;

        let mut draws = 0;
        for (model, object) in scene.objects() {
            let ring_index = self.shader_heap.transient_used(slot);
            let view = self.shader_heap.allocate_transient(slot)?;
            let offset = u64::from(ring_index) * TRANSFORM_STRIDE;

            let constants = ObjectConstants {
                model: object.transform().to_cols_array(),
                tint: object.tint(),
            };
            let ring = &mut self.transform_rings[slot];
            write_buffer(ctx, ring, offset, bytemuck::bytes_of(&constants))?;
            ctx.write_constant_buffer_view(self.shader_heap.raw(), view, ring.raw(), offset, TRANSFORM_STRIDE)?;

            ctx.cmd_draw_indexed(&DrawIndexed {
                vertex_buffer: model.vertex_buffer().raw(),
                vertex_stride: model.vertex_stride(),
                index_buffer: model.index_buffer().raw(),
                index_count: model.index_count(),
                transform_view: view,
            })?;
            draws += 1;
        }
        Ok(draws)
    }

    /// Close and submit the frame, present, then wait until the next slot is
    /// free for reuse.
    pub fn end(&mut self, ctx: &C) -> Result<()> {
        self.expect_phase(FramePhase::Recording, "end")?;
        let _scope = self.profiler.scope("Renderer::end");
        let slot = self.current_slot;

        ctx.cmd_end_pass()?;
        ctx.cmd_transition_image(ImageId::BackBuffer(slot), ResourceState::RenderTarget, ResourceState::Present)?;
        self.back_buffer_states[slot] = ResourceState::Present;

        ctx.close_command_list()?;
        ctx.execute_command_list(Submission::Frame)?;
        let value = self.fence.signal_fence_from_gpu()?;
        self.frame_values.record(slot, value);

        ctx.present()?;
        self.current_slot = ctx.current_back_buffer_index();
        self.claim_slot(self.current_slot)?;

        self.phase = FramePhase::Idle;
        self.frames_rendered += 1;
        Ok(())
    }

    /// Wait for all GPU work. Safe to call more than once.
    pub fn on_shut_down(&mut self) -> Result<()> {
        log::info!("Flushing GPU work before shutdown");
        self.fence.flush()?;
        Ok(())
    }

    /// Rebind to a recreated swapchain: drain the GPU, rebuild the depth
    /// buffer and rewrite every render target and depth view.
    pub fn resize(&mut self, ctx: &C) -> Result<()> {
        self.expect_phase(FramePhase::Idle, "resize")?;
        if ctx.back_buffer_count() != self.frame_count() {
            return Err(RenderError::Unsupported(format!(
                "swapchain changed from {} to {} back buffers",
                self.frame_count(),
                ctx.back_buffer_count()
            )));
        }
        self.fence.flush()?;

        self.viewport = ctx.dimensions();
        log::info!("Resizing to {}x{}", self.viewport.width, self.viewport.height);
        ctx.create_depth_buffer(self.viewport)?;
        for (i, rtv) in self.rtvs.iter().enumerate() {
            ctx.write_render_target_view(self.rtv_heap.raw(), *rtv, ImageId::BackBuffer(i))?;
        }
        ctx.write_depth_stencil_view(self.dsv_heap.raw(), self.dsv, ImageId::Depth)?;

        self.back_buffer_states.fill(ResourceState::Present);
        self.depth_state = ResourceState::Common;
        self.current_slot = ctx.current_back_buffer_index();
        Ok(())
    }

    /// Record work outside the frame loop and wait for it to finish. Used for
    /// uploads and the initial acceleration-structure build.
    pub fn immediate_submit<R, F>(&mut self, ctx: &C, record: F) -> Result<R>
    where
        F: FnOnce(&C, &FrameFence<C::Timeline>) -> Result<R>,
    {
        self.expect_phase(FramePhase::Idle, "immediate_submit")?;
        let slot = self.current_slot;

        self.claim_slot(slot)?;
        ctx.reset_command_list(slot)?;
        let result = record(ctx, &self.fence)?;
        ctx.close_command_list()?;
        ctx.execute_command_list(Submission::Immediate)?;

        let value = self.fence.flush()?;
        self.frame_values.record(slot, value);
        Ok(result)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frame_count(&self) -> usize {
        self.frame_values.len()
    }

    /// Fence value covering the last submission from `slot`.
    pub fn frame_fence_value(&self, slot: usize) -> FenceValue {
        self.frame_values.value(slot)
    }

    pub fn fence(&self) -> &FrameFence<C::Timeline> {
        &self.fence
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn shader_heap(&self) -> &DescriptorHeap<C::DescriptorHeap> {
        &self.shader_heap
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }
}
