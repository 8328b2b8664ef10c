// Recording GPU context for unit tests
//
// Implements every trait in `gpu` on the CPU. Buffers are byte vectors with
// fake, monotonically increasing GPU addresses; command recording appends to
// a log tests can inspect. The timeline can either stay put until a test
// completes values by hand or catch up whenever someone waits on it.

use crate::error::{RenderError, Result};
use crate::gpu::{
    AccelerationBuild, AccelerationBuildInputs, AccelerationDevice, AccelerationLevel, AccelerationObject,
    BufferDesc, BuildMode, BuildSizes, CommandQueue, CommandRecorder, DescriptorDevice, DescriptorHandle,
    DescriptorKind, DrawIndexed, FrameBindings, GpuAddress, GpuBuffer, HeapType, ImageId, PassDesc,
    PresentationSurface, ResourceDevice, ResourceState, Submission, Viewport,
};
use crate::resource::align_to;
use crate::sync::{FenceTimeline, FenceValue};
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;

const PLACEMENT_ALIGNMENT: u64 = 256;
const ADDRESS_BASE: GpuAddress = 0x1_0000_0000;

// =============================================================================
// TIMELINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuProgress {
    /// Values complete only through `MockTimeline::complete`
    Manual,
    /// A wait finishes everything up to the awaited value
    CatchUpOnWait,
}

#[derive(Debug, Default)]
struct TimelineState {
    completed: FenceValue,
    signaled: Vec<FenceValue>,
    /// Value of every blocking wait, in call order
    waits: Vec<FenceValue>,
    /// Value a waiter is currently blocked on
    pending: Option<FenceValue>,
}

#[derive(Debug, Clone)]
pub struct MockTimeline {
    progress: GpuProgress,
    shared: Arc<(Mutex<TimelineState>, Condvar)>,
}

impl MockTimeline {
    pub fn new(progress: GpuProgress) -> Self {
        Self {
            progress,
            shared: Arc::new((Mutex::new(TimelineState::default()), Condvar::new())),
        }
    }

    /// Pretend the GPU reached `value`.
    pub fn complete(&self, value: FenceValue) {
        let (state, cond) = &*self.shared;
        let mut state = state.lock();
        state.completed = state.completed.max(value);
        cond.notify_all();
    }

    pub fn signaled_values(&self) -> Vec<FenceValue> {
        self.shared.0.lock().signaled.clone()
    }

    pub fn last_signaled(&self) -> FenceValue {
        self.shared.0.lock().signaled.last().copied().unwrap_or(0)
    }

    pub fn completed(&self) -> FenceValue {
        self.shared.0.lock().completed
    }

    /// Calls to `wait`, which the fence only makes when it has to block.
    pub fn blocking_waits(&self) -> usize {
        self.shared.0.lock().waits.len()
    }

    pub fn waited_values(&self) -> Vec<FenceValue> {
        self.shared.0.lock().waits.clone()
    }

    /// Play the GPU for one blocked waiter: complete exactly the value it
    /// waits for. `None` if nobody blocked within `timeout`.
    pub fn serve_wait(&self, timeout: Duration) -> Option<FenceValue> {
        let (state, cond) = &*self.shared;
        let mut state = state.lock();
        if state.pending.is_none() {
            cond.wait_for(&mut state, timeout);
        }
        let value = state.pending.take()?;
        state.completed = state.completed.max(value);
        cond.notify_all();
        Some(value)
    }
}

impl FenceTimeline for MockTimeline {
    fn signal(&self, value: FenceValue) -> Result<()> {
        let mut state = self.shared.0.lock();
        if state.signaled.last().is_some_and(|&last| last >= value) {
            return Err(RenderError::FenceWait {
                value,
                reason: "signal values must increase".to_string(),
            });
        }
        state.signaled.push(value);
        Ok(())
    }

    fn completed_value(&self) -> Result<FenceValue> {
        Ok(self.shared.0.lock().completed)
    }

    fn wait(&self, value: FenceValue) -> Result<()> {
        let (state, cond) = &*self.shared;
        let mut state = state.lock();
        state.waits.push(value);
        match self.progress {
            GpuProgress::CatchUpOnWait => {
                state.completed = state.completed.max(value);
            }
            GpuProgress::Manual => {
                state.pending = Some(value);
                cond.notify_all();
                while state.completed < value {
                    cond.wait(&mut state);
                }
                if state.pending == Some(value) {
                    state.pending = None;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

#[derive(Debug)]
pub struct MockBuffer {
    name: String,
    size: u64,
    heap: HeapType,
    address: GpuAddress,
    allocation: u32,
    contents: Vec<u8>,
}

impl MockBuffer {
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Buffers placed in the same allocation share this id.
    pub fn allocation_id(&self) -> u32 {
        self.allocation
    }
}

impl GpuBuffer for MockBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn heap(&self) -> HeapType {
        self.heap
    }

    fn gpu_address(&self) -> GpuAddress {
        self.address
    }
}

#[derive(Debug)]
pub struct MockAccelerationStructure {
    level: AccelerationLevel,
    buffer: MockBuffer,
}

impl AccelerationObject for MockAccelerationStructure {
    fn level(&self) -> AccelerationLevel {
        self.level
    }

    fn gpu_address(&self) -> GpuAddress {
        self.buffer.address
    }

    fn result_size(&self) -> u64 {
        self.buffer.size
    }
}

#[derive(Debug)]
pub struct MockDescriptorHeap {
    name: String,
    kind: DescriptorKind,
    capacity: u32,
    shader_visible: bool,
}

impl MockDescriptorHeap {
    fn check(&self, slot: DescriptorHandle, kind: DescriptorKind) -> Result<()> {
        if self.kind != kind {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: self.name.clone(),
                reason: "view written to a heap of another kind",
            });
        }
        if slot.index() >= self.capacity {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: self.name.clone(),
                reason: "slot out of range",
            });
        }
        Ok(())
    }
}

// =============================================================================
// COMMAND LOG
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer {
        src: GpuAddress,
        src_offset: u64,
        dst: GpuAddress,
        dst_offset: u64,
        size: u64,
    },
    TransitionBuffer {
        buffer: GpuAddress,
        before: ResourceState,
        after: ResourceState,
    },
    TransitionImage {
        image: ImageId,
        before: ResourceState,
        after: ResourceState,
    },
    UavBarrier {
        structures: Vec<GpuAddress>,
    },
    BuildAccelerationStructure {
        level: AccelerationLevel,
        mode: BuildMode,
        destination: GpuAddress,
        source: Option<GpuAddress>,
        scratch: GpuAddress,
        primitive_count: u32,
    },
    WriteConstantBufferView {
        slot: DescriptorHandle,
        buffer: GpuAddress,
        offset: u64,
        size: u64,
    },
    WriteRenderTargetView {
        slot: DescriptorHandle,
        image: ImageId,
    },
    WriteDepthStencilView {
        slot: DescriptorHandle,
        image: ImageId,
    },
    BeginPass {
        target: ImageId,
        rtv: DescriptorHandle,
        dsv: DescriptorHandle,
        clear_color: [f32; 4],
    },
    EndPass,
    BindFrame {
        tlas_address: GpuAddress,
    },
    DrawIndexed {
        vertex_buffer: GpuAddress,
        index_buffer: GpuAddress,
        index_count: u32,
        transform_view: DescriptorHandle,
    },
    ResetCommandList {
        slot: usize,
    },
    CloseCommandList,
    Execute(Submission),
    Present {
        back_buffer: usize,
    },
}

// =============================================================================
// CONTEXT
// =============================================================================

pub struct MockContext {
    frame_count: usize,
    progress: GpuProgress,
    next_address: Cell<GpuAddress>,
    next_allocation: Cell<u32>,
    commands: RefCell<Vec<Command>>,
    back_buffer: Cell<usize>,
    open_slot: Cell<Option<usize>>,
    recording: Cell<bool>,
    timeline: RefCell<Option<MockTimeline>>,
    /// Fence value that covers the last submission from each slot
    slot_fences: RefCell<Vec<FenceValue>>,
    violations: RefCell<Vec<String>>,
}

impl MockContext {
    pub fn new(frame_count: usize) -> Self {
        Self::with_progress(frame_count, GpuProgress::CatchUpOnWait)
    }

    /// Context whose timeline advances as `progress` says.
    pub fn with_progress(frame_count: usize, progress: GpuProgress) -> Self {
        Self {
            frame_count,
            progress,
            next_address: Cell::new(ADDRESS_BASE),
            next_allocation: Cell::new(0),
            commands: RefCell::new(Vec::new()),
            back_buffer: Cell::new(0),
            open_slot: Cell::new(None),
            recording: Cell::new(false),
            timeline: RefCell::new(None),
            slot_fences: RefCell::new(vec![0; frame_count]),
            violations: RefCell::new(Vec::new()),
        }
    }

    /// Context with a command list already open on slot 0, for tests that
    /// record without driving a frame.
    pub fn recording(frame_count: usize) -> Self {
        let ctx = Self::new(frame_count);
        ctx.open_slot.set(Some(0));
        ctx.recording.set(true);
        ctx
    }

    /// Timeline handed out by `create_timeline`, if any.
    pub fn timeline(&self) -> Option<MockTimeline> {
        self.timeline.borrow().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }

    pub fn descriptor_heap_capacity(&self, heap: &MockDescriptorHeap) -> u32 {
        heap.capacity
    }

    /// Slots reset before the GPU finished their previous submission.
    pub fn slot_violations(&self) -> Vec<String> {
        self.violations.borrow().clone()
    }

    fn record(&self, command: Command) {
        self.commands.borrow_mut().push(command);
    }

    /// Append a command-list command; rejected outside reset..close.
    fn record_command(&self, name: &'static str, command: Command) -> Result<()> {
        if !self.recording.get() {
            return Err(RenderError::NotRecording { command: name });
        }
        self.record(command);
        Ok(())
    }

    fn new_allocation(&self) -> u32 {
        let id = self.next_allocation.get();
        self.next_allocation.set(id + 1);
        id
    }

    fn reserve_address(&self, size: u64) -> GpuAddress {
        let address = self.next_address.get();
        self.next_address.set(address + align_to(size.max(1), PLACEMENT_ALIGNMENT));
        address
    }

    fn buffer(&self, desc: &BufferDesc<'_>, address: GpuAddress, allocation: u32) -> MockBuffer {
        MockBuffer {
            name: desc.name.to_string(),
            size: desc.size,
            heap: desc.heap,
            address,
            allocation,
            contents: vec![0; desc.size as usize],
        }
    }
}

impl ResourceDevice for MockContext {
    type Buffer = MockBuffer;

    fn create_committed_buffer(&self, desc: &BufferDesc<'_>) -> Result<MockBuffer> {
        let allocation = self.new_allocation();
        let address = self.reserve_address(desc.size);
        Ok(self.buffer(desc, address, allocation))
    }

    fn create_placed_buffers(&self, descs: &[BufferDesc<'_>]) -> Result<Vec<MockBuffer>> {
        let allocation = self.new_allocation();
        Ok(descs
            .iter()
            .map(|desc| {
                let address = self.reserve_address(desc.size);
                self.buffer(desc, address, allocation)
            })
            .collect())
    }

    fn write_buffer(&self, buffer: &mut MockBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.contents.len() {
            return Err(RenderError::BufferOverflow {
                name: buffer.name.clone(),
                offset,
                len: data.len() as u64,
                size: buffer.size,
            });
        }
        buffer.contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn placement_alignment(&self) -> u64 {
        PLACEMENT_ALIGNMENT
    }
}

impl DescriptorDevice for MockContext {
    type DescriptorHeap = MockDescriptorHeap;

    fn create_descriptor_heap(
        &self,
        name: &str,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<MockDescriptorHeap> {
        Ok(MockDescriptorHeap {
            name: name.to_string(),
            kind,
            capacity,
            shader_visible,
        })
    }

    fn write_constant_buffer_view(
        &self,
        heap: &MockDescriptorHeap,
        slot: DescriptorHandle,
        buffer: &MockBuffer,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        heap.check(slot, DescriptorKind::CbvSrvUav)?;
        if !heap.shader_visible {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: heap.name.clone(),
                reason: "constant buffer views need a shader-visible heap",
            });
        }
        if offset + size > buffer.size {
            return Err(RenderError::BufferOverflow {
                name: buffer.name.clone(),
                offset,
                len: size,
                size: buffer.size,
            });
        }
        self.record(Command::WriteConstantBufferView {
            slot,
            buffer: buffer.address,
            offset,
            size,
        });
        Ok(())
    }

    fn write_render_target_view(&self, heap: &MockDescriptorHeap, slot: DescriptorHandle, image: ImageId) -> Result<()> {
        heap.check(slot, DescriptorKind::RenderTarget)?;
        self.record(Command::WriteRenderTargetView { slot, image });
        Ok(())
    }

    fn write_depth_stencil_view(&self, heap: &MockDescriptorHeap, slot: DescriptorHandle, image: ImageId) -> Result<()> {
        heap.check(slot, DescriptorKind::DepthStencil)?;
        self.record(Command::WriteDepthStencilView { slot, image });
        Ok(())
    }
}

impl AccelerationDevice for MockContext {
    type AccelerationStructure = MockAccelerationStructure;

    fn acceleration_build_sizes(&self, inputs: &AccelerationBuildInputs) -> Result<BuildSizes> {
        // Roughly proportional to the input, never zero.
        let primitives = u64::from(inputs.geometry.primitive_count()) + 1;
        Ok(BuildSizes {
            result_size: 128 * primitives,
            scratch_size: 64 * primitives,
            update_scratch_size: 32 * primitives,
        })
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        result: MockBuffer,
    ) -> Result<MockAccelerationStructure> {
        Ok(MockAccelerationStructure { level, buffer: result })
    }
}

impl CommandRecorder for MockContext {
    fn cmd_copy_buffer(
        &self,
        src: &MockBuffer,
        src_offset: u64,
        dst: &MockBuffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.record_command(
            "copy_buffer",
            Command::CopyBuffer {
                src: src.address + src_offset,
                src_offset,
                dst: dst.address + dst_offset,
                dst_offset,
                size,
            },
        )
    }

    fn cmd_transition_buffer(&self, buffer: &MockBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        self.record_command(
            "transition_buffer",
            Command::TransitionBuffer {
                buffer: buffer.address,
                before,
                after,
            },
        )
    }

    fn cmd_transition_image(&self, image: ImageId, before: ResourceState, after: ResourceState) -> Result<()> {
        if let ImageId::BackBuffer(i) = image {
            if i >= self.frame_count {
                return Err(RenderError::ImageUnavailable {
                    image,
                    reason: "no such back buffer",
                });
            }
        }
        self.record_command("transition_image", Command::TransitionImage { image, before, after })
    }

    fn cmd_uav_barrier(&self, structures: &[&MockAccelerationStructure]) -> Result<()> {
        self.record_command(
            "uav_barrier",
            Command::UavBarrier {
                structures: structures.iter().map(|s| s.gpu_address()).collect(),
            },
        )
    }

    fn cmd_build_acceleration_structure(
        &self,
        build: &AccelerationBuild<'_, MockAccelerationStructure, MockBuffer>,
    ) -> Result<()> {
        self.record_command(
            "build_acceleration_structure",
            Command::BuildAccelerationStructure {
                level: build.destination.level,
                mode: build.mode,
                destination: build.destination.gpu_address(),
                source: build.source.map(|s| s.gpu_address()),
                scratch: build.scratch.address,
                primitive_count: build.inputs.geometry.primitive_count(),
            },
        )
    }

    fn cmd_begin_pass(&self, pass: &PassDesc<'_, MockDescriptorHeap>) -> Result<()> {
        self.record_command(
            "begin_pass",
            Command::BeginPass {
                target: pass.target,
                rtv: pass.rtv,
                dsv: pass.dsv,
                clear_color: pass.clear_color,
            },
        )
    }

    fn cmd_end_pass(&self) -> Result<()> {
        self.record_command("end_pass", Command::EndPass)
    }

    fn cmd_bind_frame(&self, bindings: &FrameBindings<'_, MockDescriptorHeap>) -> Result<()> {
        self.record_command(
            "bind_frame",
            Command::BindFrame {
                tlas_address: bindings.tlas_address,
            },
        )
    }

    fn cmd_draw_indexed(&self, draw: &DrawIndexed<'_, MockBuffer>) -> Result<()> {
        self.record_command(
            "draw_indexed",
            Command::DrawIndexed {
                vertex_buffer: draw.vertex_buffer.address,
                index_buffer: draw.index_buffer.address,
                index_count: draw.index_count,
                transform_view: draw.transform_view,
            },
        )
    }
}

impl CommandQueue for MockContext {
    type Timeline = MockTimeline;

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn create_timeline(&self) -> Result<MockTimeline> {
        let timeline = MockTimeline::new(self.progress);
        *self.timeline.borrow_mut() = Some(timeline.clone());
        Ok(timeline)
    }

    fn reset_command_list(&self, frame_slot: usize) -> Result<()> {
        if let Some(timeline) = self.timeline.borrow().as_ref() {
            let required = self.slot_fences.borrow()[frame_slot];
            let completed = timeline.completed();
            if completed < required {
                self.violations.borrow_mut().push(format!(
                    "slot {frame_slot} reset at fence {completed}, still needs {required}"
                ));
            }
        }
        self.open_slot.set(Some(frame_slot));
        self.recording.set(true);
        self.record(Command::ResetCommandList { slot: frame_slot });
        Ok(())
    }

    fn close_command_list(&self) -> Result<()> {
        self.record_command("close_command_list", Command::CloseCommandList)?;
        self.recording.set(false);
        Ok(())
    }

    fn execute_command_list(&self, submission: Submission) -> Result<()> {
        // The next signal covers this submission.
        if let (Some(slot), Some(timeline)) = (self.open_slot.take(), self.timeline.borrow().as_ref()) {
            self.slot_fences.borrow_mut()[slot] = timeline.last_signaled() + 1;
        }
        self.record(Command::Execute(submission));
        Ok(())
    }
}

impl PresentationSurface for MockContext {
    fn back_buffer_count(&self) -> usize {
        self.frame_count
    }

    fn current_back_buffer_index(&self) -> usize {
        self.back_buffer.get()
    }

    fn dimensions(&self) -> Viewport {
        Viewport {
            width: 1280,
            height: 720,
        }
    }

    fn create_depth_buffer(&self, _viewport: Viewport) -> Result<()> {
        Ok(())
    }

    fn present(&self) -> Result<()> {
        let current = self.back_buffer.get();
        self.record(Command::Present { back_buffer: current });
        self.back_buffer.set((current + 1) % self.frame_count);
        Ok(())
    }
}
