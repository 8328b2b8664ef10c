// =============================================================================
// VULKAN CONTEXT - the `gpu` traits on real hardware
// =============================================================================
//
// One graphics queue, one command pool + primary command buffer per frame
// slot (slot == swapchain image), one open command list at a time.
//
// STATE MAPPING:
// ┌──────────────────────┬───────────────────────────────────────────────┐
// │ ResourceState        │ sync2 stage / access / image layout           │
// ├──────────────────────┼───────────────────────────────────────────────┤
// │ RenderTarget         │ color output, COLOR_ATTACHMENT_OPTIMAL        │
// │ DepthWrite           │ fragment tests, DEPTH_ATTACHMENT_OPTIMAL      │
// │ Present              │ PRESENT_SRC (as a source: UNDEFINED)          │
// │ AccelerationStructure│ AS build + fragment shader, AS read/write     │
// │ UnorderedAccess      │ AS build scratch read/write                   │
// └──────────────────────┴───────────────────────────────────────────────┘
//
// The UAV barrier is a global AS-write -> AS-read memory barrier. Render
// target and depth views are image views stored in CPU-side heaps.

use super::accel::{self, VulkanAccelerationStructure};
use super::buffer::{depth_subresource_range, DepthBuffer, VulkanBuffer};
use super::descriptor::{create_set_layout, VulkanDescriptorHeap};
use super::pipeline::{
    create_pipeline_layout, FramePushConstants, GraphicsPipeline, PUSH_CONSTANT_STAGES, TRANSFORM_INDEX_OFFSET,
};
use super::surface::create_surface;
use super::swapchain::{color_subresource_range, Swapchain, SwapchainDesc};
use super::sync::{PresentSync, TimelineFence};
use super::VulkanDevice;
use crate::error::{RenderError, Result};
use crate::gpu::{
    AccelerationBuild, AccelerationBuildInputs, AccelerationDevice, AccelerationLevel, BufferDesc, BuildSizes,
    CommandQueue, CommandRecorder, DescriptorDevice, DescriptorHandle, DescriptorKind, DrawIndexed, FrameBindings,
    ImageId, PassDesc, PresentationSurface, ResourceDevice, ResourceState, Submission, Viewport,
};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::cell::{Cell, RefCell};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Buffer placement granularity; also the constant-buffer view alignment.
const PLACEMENT_ALIGNMENT: u64 = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Barrier translation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct StateAccess {
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
}

fn state_access(state: ResourceState) -> StateAccess {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;

    let (stage, access, layout) = match state {
        ResourceState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, vk::ImageLayout::GENERAL),
        ResourceState::CopyDest => (S::COPY, A::TRANSFER_WRITE, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        ResourceState::CopySource => (S::COPY, A::TRANSFER_READ, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        ResourceState::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ, vk::ImageLayout::GENERAL),
        ResourceState::ShaderResource => (
            S::VERTEX_ATTRIBUTE_INPUT
                | S::INDEX_INPUT
                | S::VERTEX_SHADER
                | S::FRAGMENT_SHADER
                | S::ACCELERATION_STRUCTURE_BUILD_KHR,
            A::VERTEX_ATTRIBUTE_READ | A::INDEX_READ | A::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::UnorderedAccess => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR,
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::AccelerationStructure => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR | S::FRAGMENT_SHADER,
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::Present => (S::COLOR_ATTACHMENT_OUTPUT, A::NONE, vk::ImageLayout::PRESENT_SRC_KHR),
    };
    StateAccess { stage, access, layout }
}

/// Old layout for an image leaving `before`. Contents of presented and
/// freshly created images are discarded.
fn source_layout(before: ResourceState) -> vk::ImageLayout {
    match before {
        ResourceState::Present | ResourceState::Common => vk::ImageLayout::UNDEFINED,
        other => state_access(other).layout,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-slot command recording
// ─────────────────────────────────────────────────────────────────────────────

struct FrameCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl FrameCommands {
    fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.graphics_queue_family);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => Ok(Self {
                pool,
                buffer: buffers[0],
            }),
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                Err(e.into())
            }
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Idle,
    Recording(usize),
    Closed(usize),
}

/// Startup parameters for the context.
#[derive(Debug, Clone)]
pub struct ContextDesc<'a> {
    pub app_name: &'a str,
    pub enable_validation: bool,
    pub width: u32,
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Requested swapchain image count; the surface may grant more
    pub frame_count: u32,
}

pub struct VulkanContext {
    // ─────────────────────────────────────────────────────────────────────────
    // PRESENTATION
    // ─────────────────────────────────────────────────────────────────────────
    swapchain: ManuallyDrop<Swapchain>,
    swapchain_desc: SwapchainDesc,
    present: RefCell<PresentSync>,
    image_index: Cell<u32>,
    /// Set by present/acquire when the surface changed under us
    needs_recreate: Cell<bool>,
    depth: RefCell<Option<DepthBuffer>>,

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    frames: Vec<FrameCommands>,
    list: Cell<ListState>,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE STATE
    // ─────────────────────────────────────────────────────────────────────────
    pipeline: Option<GraphicsPipeline>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    device: Arc<VulkanDevice>,
}

impl VulkanContext {
    /// Initialize all Vulkan resources for `window`.
    ///
    /// 1. Vulkan device (ray query capable GPU)
    /// 2. Surface (window connection)
    /// 3. Swapchain + present semaphores, first image acquired
    /// 4. Command pools, one per swapchain image
    /// 5. Descriptor set layout + pipeline layout
    pub fn new<W>(window: &W, desc: &ContextDesc<'_>) -> anyhow::Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        log::info!("Initializing Vulkan...");

        let device = VulkanDevice::new(desc.app_name, desc.enable_validation)?;
        let surface_loader = khr::Surface::new(&device.entry, &device.instance);
        let surface = create_surface(&device, &surface_loader, window)?;

        let swapchain_desc = SwapchainDesc {
            width: desc.width,
            height: desc.height,
            present_mode: desc.present_mode,
            image_count: desc.frame_count,
        };
        let swapchain = match Swapchain::new(Arc::clone(&device), surface, &surface_loader, &swapchain_desc, None) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };
        let image_count = swapchain.images.len();

        let present = PresentSync::new(&device, image_count)?;
        let frames = (0..image_count)
            .map(|_| FrameCommands::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let set_layout = create_set_layout(&device)?;
        let pipeline_layout = create_pipeline_layout(&device, set_layout)?;

        let context = Self {
            swapchain: ManuallyDrop::new(swapchain),
            swapchain_desc,
            present: RefCell::new(present),
            image_index: Cell::new(0),
            needs_recreate: Cell::new(false),
            depth: RefCell::new(None),
            frames,
            list: Cell::new(ListState::Idle),
            pipeline: None,
            set_layout,
            pipeline_layout,
            surface,
            surface_loader,
            device,
        };
        context.acquire_next_image()?;

        log::info!("Vulkan initialized successfully!");
        Ok(context)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn color_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.swapchain.present_mode
    }

    /// Install the pipeline draws are recorded with. Without one, frames
    /// only clear.
    pub fn set_pipeline(&mut self, pipeline: GraphicsPipeline) {
        self.pipeline = Some(pipeline);
    }

    /// True once present or acquire reported an out-of-date or suboptimal
    /// swapchain.
    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate.get()
    }

    /// Rebuild the swapchain for a new window size. The caller follows up
    /// with `Renderer::resize`.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.device.wait_idle()?;

        self.swapchain_desc.width = width;
        self.swapchain_desc.height = height;
        let swapchain = Swapchain::new(
            Arc::clone(&self.device),
            self.surface,
            &self.surface_loader,
            &self.swapchain_desc,
            Some(&self.swapchain),
        )?;
        // Old chain is dropped here, after the new one retired it
        drop(std::mem::replace(&mut *self.swapchain, swapchain));

        let present = PresentSync::new(&self.device, self.swapchain.images.len())?;
        self.present.replace(present).destroy(&self.device.device);

        self.needs_recreate.set(false);
        self.acquire_next_image()?;
        Ok(())
    }

    fn acquire_next_image(&self) -> Result<()> {
        let mut present = self.present.borrow_mut();
        let semaphore = present.next_acquire_semaphore(&self.device.device)?;
        match self.swapchain.acquire_next_image(u64::MAX, semaphore)? {
            Some((index, suboptimal)) => {
                present.assign_acquired(index as usize);
                self.image_index.set(index);
                if suboptimal {
                    self.needs_recreate.set(true);
                }
            }
            None => self.needs_recreate.set(true),
        }
        Ok(())
    }

    /// Command buffer of the open list.
    fn recording(&self, command: &'static str) -> Result<vk::CommandBuffer> {
        match self.list.get() {
            ListState::Recording(slot) => Ok(self.frames[slot].buffer),
            state => {
                log::error!("`{}` recorded while the command list is {:?}", command, state);
                Err(RenderError::NotRecording { command })
            }
        }
    }

    fn image(&self, image: ImageId) -> Result<(vk::Image, vk::ImageSubresourceRange)> {
        match image {
            ImageId::BackBuffer(i) => self
                .swapchain
                .images
                .get(i)
                .map(|&img| (img, color_subresource_range()))
                .ok_or(RenderError::ImageUnavailable {
                    image,
                    reason: "no such back buffer",
                }),
            ImageId::Depth => self
                .depth
                .borrow()
                .as_ref()
                .map(|d| (d.image, depth_subresource_range()))
                .ok_or(RenderError::ImageUnavailable {
                    image,
                    reason: "depth buffer not created",
                }),
        }
    }

    fn image_view(&self, image: ImageId) -> Result<vk::ImageView> {
        match image {
            ImageId::BackBuffer(i) => self
                .swapchain
                .image_views
                .get(i)
                .copied()
                .ok_or(RenderError::ImageUnavailable {
                    image,
                    reason: "no such back buffer",
                }),
            ImageId::Depth => self
                .depth
                .borrow()
                .as_ref()
                .map(|d| d.view)
                .ok_or(RenderError::ImageUnavailable {
                    image,
                    reason: "depth buffer not created",
                }),
        }
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

impl ResourceDevice for VulkanContext {
    type Buffer = VulkanBuffer;

    fn create_committed_buffer(&self, desc: &BufferDesc<'_>) -> Result<VulkanBuffer> {
        VulkanBuffer::create_placed(&self.device, std::slice::from_ref(desc))?
            .pop()
            .ok_or_else(|| RenderError::ZeroSizedBuffer {
                name: desc.name.to_string(),
            })
    }

    fn create_placed_buffers(&self, descs: &[BufferDesc<'_>]) -> Result<Vec<VulkanBuffer>> {
        VulkanBuffer::create_placed(&self.device, descs)
    }

    fn write_buffer(&self, buffer: &mut VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write(offset, data)
    }

    fn placement_alignment(&self) -> u64 {
        PLACEMENT_ALIGNMENT
    }
}

impl DescriptorDevice for VulkanContext {
    type DescriptorHeap = VulkanDescriptorHeap;

    fn create_descriptor_heap(
        &self,
        name: &str,
        kind: DescriptorKind,
        capacity: u32,
        _shader_visible: bool,
    ) -> Result<VulkanDescriptorHeap> {
        VulkanDescriptorHeap::new(&self.device, self.set_layout, name, kind, capacity)
    }

    fn write_constant_buffer_view(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: DescriptorHandle,
        buffer: &VulkanBuffer,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        heap.write_storage_buffer(slot, buffer.raw, offset, size)
    }

    fn write_render_target_view(&self, heap: &VulkanDescriptorHeap, slot: DescriptorHandle, image: ImageId) -> Result<()> {
        heap.write_view(slot, DescriptorKind::RenderTarget, self.image_view(image)?)
    }

    fn write_depth_stencil_view(&self, heap: &VulkanDescriptorHeap, slot: DescriptorHandle, image: ImageId) -> Result<()> {
        heap.write_view(slot, DescriptorKind::DepthStencil, self.image_view(image)?)
    }
}

impl AccelerationDevice for VulkanContext {
    type AccelerationStructure = VulkanAccelerationStructure;

    fn acceleration_build_sizes(&self, inputs: &AccelerationBuildInputs) -> Result<BuildSizes> {
        Ok(accel::build_sizes(&self.device, inputs))
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        result: VulkanBuffer,
    ) -> Result<VulkanAccelerationStructure> {
        VulkanAccelerationStructure::new(&self.device, level, result)
    }
}

// =============================================================================
// RECORDING
// =============================================================================

impl CommandRecorder for VulkanContext {
    fn cmd_copy_buffer(
        &self,
        src: &VulkanBuffer,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let cmd = self.recording("copy_buffer")?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe { self.device.device.cmd_copy_buffer(cmd, src.raw, dst.raw, &[region]) };
        Ok(())
    }

    fn cmd_transition_buffer(&self, buffer: &VulkanBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        let cmd = self.recording("transition_buffer")?;
        let (src, dst) = (state_access(before), state_access(after));
        let barrier = vk::BufferMemoryBarrier2::builder()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.raw)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        let dependency = vk::DependencyInfo::builder().buffer_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }

    fn cmd_transition_image(&self, image: ImageId, before: ResourceState, after: ResourceState) -> Result<()> {
        let cmd = self.recording("transition_image")?;
        let (raw, range) = self.image(image)?;
        let (src, dst) = (state_access(before), state_access(after));
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .old_layout(source_layout(before))
            .new_layout(dst.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(raw)
            .subresource_range(range)
            .build();
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }

    fn cmd_uav_barrier(&self, _structures: &[&VulkanAccelerationStructure]) -> Result<()> {
        let cmd = self.recording("uav_barrier")?;
        let barrier = vk::MemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            )
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR)
            .build();
        let dependency = vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &self,
        build: &AccelerationBuild<'_, VulkanAccelerationStructure, VulkanBuffer>,
    ) -> Result<()> {
        let cmd = self.recording("build_acceleration_structure")?;
        accel::record_build(&self.device, cmd, build);
        Ok(())
    }

    fn cmd_begin_pass(&self, pass: &PassDesc<'_, VulkanDescriptorHeap>) -> Result<()> {
        let cmd = self.recording("begin_pass")?;
        let color_view = pass.rtv_heap.view(pass.rtv).ok_or(RenderError::ImageUnavailable {
            image: pass.target,
            reason: "render target view not written",
        })?;
        let depth_view = pass.dsv_heap.view(pass.dsv).ok_or(RenderError::ImageUnavailable {
            image: ImageId::Depth,
            reason: "depth stencil view not written",
        })?;

        let color = vk::RenderingAttachmentInfo::builder()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: pass.clear_color,
                },
            })
            .build();
        let depth = vk::RenderingAttachmentInfo::builder()
            .image_view(depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: pass.clear_depth,
                    stencil: 0,
                },
            })
            .build();

        let rendering = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: pass.viewport.width,
                    height: pass.viewport.height,
                },
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color))
            .depth_attachment(&depth);
        unsafe { self.device.device.cmd_begin_rendering(cmd, &rendering) };
        Ok(())
    }

    fn cmd_end_pass(&self) -> Result<()> {
        let cmd = self.recording("end_pass")?;
        unsafe { self.device.device.cmd_end_rendering(cmd) };
        Ok(())
    }

    fn cmd_bind_frame(&self, bindings: &FrameBindings<'_, VulkanDescriptorHeap>) -> Result<()> {
        let cmd = self.recording("bind_frame")?;
        let device = &self.device.device;
        let (width, height) = (bindings.viewport.width as f32, bindings.viewport.height as f32);

        unsafe {
            if let Some(pipeline) = &self.pipeline {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            }

            // Negative height keeps +Y up in clip space
            let viewport = vk::Viewport {
                x: 0.0,
                y: height,
                width,
                height: -height,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: bindings.viewport.width,
                    height: bindings.viewport.height,
                },
            };
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            if let Some(set) = bindings.descriptor_heap.descriptor_set() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
            }

            let constants = FramePushConstants {
                view_projection: bindings.view_projection.to_cols_array(),
                tlas_address: bindings.tlas_address,
            };
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                PUSH_CONSTANT_STAGES,
                0,
                bytemuck::bytes_of(&constants),
            );
        }
        Ok(())
    }

    fn cmd_draw_indexed(&self, draw: &DrawIndexed<'_, VulkanBuffer>) -> Result<()> {
        let cmd = self.recording("draw_indexed")?;
        if self.pipeline.is_none() {
            log::trace!("No pipeline bound, draw skipped");
            return Ok(());
        }
        let device = &self.device.device;
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer.raw], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer.raw, 0, vk::IndexType::UINT32);
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                PUSH_CONSTANT_STAGES,
                TRANSFORM_INDEX_OFFSET,
                bytemuck::bytes_of(&draw.transform_view.index()),
            );
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
        }
        Ok(())
    }
}

// =============================================================================
// QUEUE
// =============================================================================

impl CommandQueue for VulkanContext {
    type Timeline = TimelineFence;

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn create_timeline(&self) -> Result<TimelineFence> {
        TimelineFence::new(&self.device)
    }

    fn reset_command_list(&self, frame_slot: usize) -> Result<()> {
        if self.list.get() != ListState::Idle {
            return Err(RenderError::Unsupported(format!(
                "command list reset while {:?}",
                self.list.get()
            )));
        }
        let frame = self
            .frames
            .get(frame_slot)
            .ok_or_else(|| RenderError::Unsupported(format!("no frame slot {frame_slot}")))?;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .reset_command_pool(frame.pool, vk::CommandPoolResetFlags::empty())?;
            self.device.device.begin_command_buffer(frame.buffer, &begin_info)?;
        }
        self.list.set(ListState::Recording(frame_slot));
        Ok(())
    }

    fn close_command_list(&self) -> Result<()> {
        let ListState::Recording(slot) = self.list.get() else {
            return Err(RenderError::NotRecording {
                command: "close_command_list",
            });
        };
        unsafe { self.device.device.end_command_buffer(self.frames[slot].buffer) }?;
        self.list.set(ListState::Closed(slot));
        Ok(())
    }

    fn execute_command_list(&self, submission: Submission) -> Result<()> {
        let ListState::Closed(slot) = self.list.get() else {
            return Err(RenderError::Unsupported("no closed command list to execute".to_string()));
        };
        let command_buffer_info = vk::CommandBufferSubmitInfo::builder()
            .command_buffer(self.frames[slot].buffer)
            .build();
        let command_buffers = std::slice::from_ref(&command_buffer_info);
        let queue = self.device.graphics_queue;

        match submission {
            Submission::Immediate => {
                let submit = vk::SubmitInfo2::builder().command_buffer_infos(command_buffers).build();
                unsafe { self.device.device.queue_submit2(queue, &[submit], vk::Fence::null()) }?;
            }
            Submission::Frame => {
                let image = self.image_index.get() as usize;
                let present = self.present.borrow();
                let fence = present.image_fences[image];
                let wait = vk::SemaphoreSubmitInfo::builder()
                    .semaphore(present.image_available[image])
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .build();
                let signal = vk::SemaphoreSubmitInfo::builder()
                    .semaphore(present.render_finished[image])
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build();
                let submit = vk::SubmitInfo2::builder()
                    .wait_semaphore_infos(std::slice::from_ref(&wait))
                    .command_buffer_infos(command_buffers)
                    .signal_semaphore_infos(std::slice::from_ref(&signal))
                    .build();
                unsafe {
                    self.device.device.reset_fences(&[fence])?;
                    self.device.device.queue_submit2(queue, &[submit], fence)?;
                }
            }
        }
        self.list.set(ListState::Idle);
        Ok(())
    }
}

// =============================================================================
// PRESENTATION
// =============================================================================

impl PresentationSurface for VulkanContext {
    fn back_buffer_count(&self) -> usize {
        self.swapchain.images.len()
    }

    fn current_back_buffer_index(&self) -> usize {
        self.image_index.get() as usize
    }

    fn dimensions(&self) -> Viewport {
        Viewport {
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
        }
    }

    fn create_depth_buffer(&self, viewport: Viewport) -> Result<()> {
        let extent = vk::Extent2D {
            width: viewport.width,
            height: viewport.height,
        };
        let depth = DepthBuffer::new(&self.device, extent)?;
        // Previous depth buffer (if any) is only dropped after the GPU idled
        self.depth.replace(Some(depth));
        Ok(())
    }

    fn present(&self) -> Result<()> {
        let image = self.image_index.get();
        let wait = [self.present.borrow().render_finished[image as usize]];
        if self.swapchain.present(self.device.graphics_queue, image, &wait)? {
            self.needs_recreate.set(true);
        }
        self.acquire_next_image()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan context...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait before teardown failed: {}", e);
        }

        self.pipeline = None;
        self.depth.get_mut().take();
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
        self.present.get_mut().destroy(&self.device.device);

        unsafe {
            self.device.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.device.destroy_descriptor_set_layout(self.set_layout, None);
            // Swapchain must go before its surface
            ManuallyDrop::drop(&mut self.swapchain);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presented_images_are_discarded_on_reuse() {
        assert_eq!(source_layout(ResourceState::Present), vk::ImageLayout::UNDEFINED);
        assert_eq!(source_layout(ResourceState::Common), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            source_layout(ResourceState::RenderTarget),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn acceleration_states_synchronize_builds() {
        let access = state_access(ResourceState::AccelerationStructure);
        assert!(access
            .stage
            .contains(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR));
        assert!(access
            .access
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR));

        let scratch = state_access(ResourceState::UnorderedAccess);
        assert_eq!(scratch.stage, vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR);
    }

    #[test]
    fn attachment_states_use_attachment_layouts() {
        assert_eq!(
            state_access(ResourceState::DepthWrite).layout,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        );
        assert_eq!(state_access(ResourceState::Present).layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(state_access(ResourceState::Present).access, vk::AccessFlags2::NONE);
    }
}
