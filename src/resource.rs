// Resource allocation and state tracking
//
// Buffers are created through the device with their size rounded up to the
// device's placement alignment. Each buffer is wrapped in `Resource`, which
// remembers the logical state the last recorded barrier left it in.

use crate::error::{RenderError, Result};
use crate::gpu::{BufferDesc, BufferUsage, CommandRecorder, GpuAddress, GpuBuffer, HeapType, ResourceDevice, ResourceState};
use crate::sync::FenceValue;

/// Round `size` up to a multiple of `alignment` (a power of two).
pub fn align_to(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

/// A buffer plus the state it is currently tracked in.
#[derive(Debug)]
pub struct Resource<B> {
    raw: B,
    state: ResourceState,
}

impl<B: GpuBuffer> Resource<B> {
    pub fn new(raw: B, state: ResourceState) -> Self {
        Self { raw, state }
    }

    pub fn raw(&self) -> &B {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut B {
        &mut self.raw
    }

    pub fn into_raw(self) -> B {
        self.raw
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn name(&self) -> &str {
        self.raw.name()
    }

    pub fn size(&self) -> u64 {
        self.raw.size()
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.raw.gpu_address()
    }

    /// Record a barrier to `after`. Nothing is recorded if already there.
    /// The tracked state only moves once the barrier is recorded.
    pub fn transition<C>(&mut self, recorder: &C, after: ResourceState) -> Result<()>
    where
        C: CommandRecorder<Buffer = B>,
    {
        if self.state == after {
            return Ok(());
        }
        recorder.cmd_transition_buffer(&self.raw, self.state, after)?;
        self.state = after;
        Ok(())
    }

    /// Fail unless the buffer is tracked in `expected`.
    pub fn require(&self, expected: ResourceState) -> Result<()> {
        if self.state != expected {
            return Err(RenderError::InvalidResourceState {
                name: self.raw.name().to_string(),
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

fn aligned_desc<'a, D: ResourceDevice + ?Sized>(device: &D, desc: &BufferDesc<'a>) -> Result<BufferDesc<'a>> {
    if desc.size == 0 {
        return Err(RenderError::ZeroSizedBuffer {
            name: desc.name.to_string(),
        });
    }
    Ok(BufferDesc {
        size: align_to(desc.size, device.placement_alignment()),
        ..desc.clone()
    })
}

/// Create a buffer with its own allocation.
pub fn create_buffer<D: ResourceDevice + ?Sized>(device: &D, desc: &BufferDesc<'_>) -> Result<Resource<D::Buffer>> {
    let desc = aligned_desc(device, desc)?;
    let raw = device.create_committed_buffer(&desc)?;
    log::debug!("Created buffer `{}` ({} bytes, {:?})", desc.name, desc.size, desc.heap);
    Ok(Resource::new(raw, desc.initial_state))
}

/// Create two buffers that share one allocation.
pub fn create_placed_pair<D: ResourceDevice + ?Sized>(
    device: &D,
    first: &BufferDesc<'_>,
    second: &BufferDesc<'_>,
) -> Result<(Resource<D::Buffer>, Resource<D::Buffer>)> {
    let descs = [aligned_desc(device, first)?, aligned_desc(device, second)?];
    let mut buffers = device.create_placed_buffers(&descs)?.into_iter();
    match (buffers.next(), buffers.next()) {
        (Some(a), Some(b)) => Ok((
            Resource::new(a, descs[0].initial_state),
            Resource::new(b, descs[1].initial_state),
        )),
        _ => Err(RenderError::Unsupported(format!(
            "placed allocation for `{}` returned fewer than two buffers",
            first.name
        ))),
    }
}

/// Bounds-checked CPU write into an upload buffer.
pub fn write_buffer<D: ResourceDevice + ?Sized>(
    device: &D,
    buffer: &mut Resource<D::Buffer>,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if buffer.raw().heap() != HeapType::Upload {
        return Err(RenderError::NotCpuWritable {
            name: buffer.name().to_string(),
        });
    }
    let len = data.len() as u64;
    if offset + len > buffer.size() {
        return Err(RenderError::BufferOverflow {
            name: buffer.name().to_string(),
            offset,
            len,
            size: buffer.size(),
        });
    }
    device.write_buffer(buffer.raw_mut(), offset, data)
}

/// Fill `dst` (default heap, `CopyDest`) from a new upload buffer, then
/// transition it to `final_state`. Returns the staging buffer, which must
/// live until the recorded copy has executed.
pub fn upload_to_default<C: CommandRecorder>(
    recorder: &C,
    dst: &mut Resource<C::Buffer>,
    data: &[u8],
    final_state: ResourceState,
) -> Result<Resource<C::Buffer>> {
    let staging_name = format!("{} (staging)", dst.name());
    let mut staging = create_buffer(
        recorder,
        &BufferDesc {
            name: &staging_name,
            size: data.len() as u64,
            heap: HeapType::Upload,
            initial_state: ResourceState::GenericRead,
            usage: BufferUsage::empty(),
        },
    )?;
    write_buffer(recorder, &mut staging, 0, data)?;

    dst.transition(recorder, ResourceState::CopyDest)?;
    recorder.cmd_copy_buffer(staging.raw(), 0, dst.raw(), 0, data.len() as u64)?;
    dst.transition(recorder, final_state)?;
    Ok(staging)
}

// =============================================================================
// DEFERRED RELEASE
// =============================================================================

/// Keeps GPU objects alive until the fence value they were retired with has
/// been reached.
#[derive(Debug)]
pub struct RetireQueue<T> {
    entries: Vec<(FenceValue, T)>,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> RetireQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&mut self, after: FenceValue, item: T) {
        self.entries.push((after, item));
    }

    /// Drop everything whose fence value is at or below `completed`.
    /// Returns how many objects were released.
    pub fn collect(&mut self, completed: FenceValue) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(value, _)| *value > completed);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Command, MockContext};

    fn desc(name: &str, size: u64, heap: HeapType) -> BufferDesc<'_> {
        BufferDesc {
            name,
            size,
            heap,
            initial_state: ResourceState::Common,
            usage: BufferUsage::empty(),
        }
    }

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 65536), 65536);
        assert_eq!(align_to(0, 64), 0);
    }

    #[test]
    fn buffer_size_is_rounded_to_placement_alignment() {
        let ctx = MockContext::new(3);
        let buffer = create_buffer(&ctx, &desc("cb", 100, HeapType::Upload)).unwrap();
        assert_eq!(buffer.size(), ctx.placement_alignment());
        assert_eq!(buffer.state(), ResourceState::Common);
    }

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let ctx = MockContext::new(3);
        let err = create_buffer(&ctx, &desc("empty", 0, HeapType::Default)).unwrap_err();
        assert!(matches!(err, RenderError::ZeroSizedBuffer { .. }));
    }

    #[test]
    fn transition_records_barrier_once() {
        let ctx = MockContext::recording(3);
        let mut buffer = create_buffer(&ctx, &desc("vb", 64, HeapType::Default)).unwrap();

        buffer.transition(&ctx, ResourceState::CopyDest).unwrap();
        buffer.transition(&ctx, ResourceState::CopyDest).unwrap();

        let transitions: Vec<_> = ctx
            .commands()
            .into_iter()
            .filter(|c| matches!(c, Command::TransitionBuffer { .. }))
            .collect();
        assert_eq!(transitions.len(), 1);
        assert_eq!(buffer.state(), ResourceState::CopyDest);
    }

    #[test]
    fn transition_without_open_list_keeps_tracked_state() {
        let ctx = MockContext::new(3);
        let mut buffer = create_buffer(&ctx, &desc("vb", 64, HeapType::Default)).unwrap();

        let err = buffer.transition(&ctx, ResourceState::CopyDest).unwrap_err();

        assert!(matches!(err, RenderError::NotRecording { .. }));
        assert_eq!(buffer.state(), ResourceState::Common);
        assert!(ctx.commands().is_empty());
    }

    #[test]
    fn require_reports_state_mismatch() {
        let ctx = MockContext::new(3);
        let buffer = create_buffer(&ctx, &desc("ib", 64, HeapType::Default)).unwrap();

        let err = buffer.require(ResourceState::ShaderResource).unwrap_err();
        match err {
            RenderError::InvalidResourceState { expected, actual, .. } => {
                assert_eq!(expected, ResourceState::ShaderResource);
                assert_eq!(actual, ResourceState::Common);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn writes_to_default_heap_are_rejected() {
        let ctx = MockContext::new(3);
        let mut buffer = create_buffer(&ctx, &desc("gpu-only", 64, HeapType::Default)).unwrap();
        let err = write_buffer(&ctx, &mut buffer, 0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RenderError::NotCpuWritable { .. }));
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let ctx = MockContext::new(3);
        let mut buffer = create_buffer(&ctx, &desc("upload", 16, HeapType::Upload)).unwrap();
        let size = buffer.size();
        let err = write_buffer(&ctx, &mut buffer, size - 2, &[0; 4]).unwrap_err();
        assert!(matches!(err, RenderError::BufferOverflow { .. }));
    }

    #[test]
    fn upload_copies_then_transitions() {
        let ctx = MockContext::recording(3);
        let mut dst = create_buffer(
            &ctx,
            &BufferDesc {
                initial_state: ResourceState::CopyDest,
                ..desc("mesh", 12, HeapType::Default)
            },
        )
        .unwrap();

        let staging = upload_to_default(&ctx, &mut dst, &[7; 12], ResourceState::ShaderResource).unwrap();

        assert_eq!(&staging.raw().contents()[..12], &[7; 12]);
        assert_eq!(dst.state(), ResourceState::ShaderResource);
        let commands = ctx.commands();
        assert!(matches!(commands[0], Command::CopyBuffer { size: 12, .. }));
        assert!(matches!(
            commands[1],
            Command::TransitionBuffer {
                before: ResourceState::CopyDest,
                after: ResourceState::ShaderResource,
                ..
            }
        ));
    }

    #[test]
    fn placed_pair_shares_one_allocation() {
        let ctx = MockContext::new(3);
        let (a, b) = create_placed_pair(
            &ctx,
            &desc("vertices", 100, HeapType::Default),
            &desc("indices", 50, HeapType::Default),
        )
        .unwrap();

        assert_eq!(a.raw().allocation_id(), b.raw().allocation_id());
        assert!(b.gpu_address() >= a.gpu_address() + a.size());
    }

    #[test]
    fn retire_queue_releases_completed_entries() {
        let mut queue = RetireQueue::new();
        queue.retire(1, "scratch-a");
        queue.retire(3, "scratch-b");

        assert_eq!(queue.collect(0), 0);
        assert_eq!(queue.collect(2), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.collect(3), 1);
        assert!(queue.is_empty());
    }
}
