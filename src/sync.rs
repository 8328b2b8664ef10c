// Frame synchronization
//
// CPU/GPU sync is a single monotonically increasing counter:
// - every submitted batch is followed by a GPU signal of counter+1
// - a value V is reached once the GPU's completed value is >= V
// - the CPU blocks on V before reusing anything the batch touched
//
// The fence primitive itself is behind `FenceTimeline` so the engine runs
// unchanged on a Vulkan timeline semaphore and on the test recorder.

use crate::error::Result;

/// Value on the fence timeline. Zero is "nothing submitted yet".
pub type FenceValue = u64;

/// GPU fence capability.
pub trait FenceTimeline {
    /// Enqueue a GPU-side signal of `value` after all submitted work.
    fn signal(&self, value: FenceValue) -> Result<()>;

    /// Last value the GPU has reached.
    fn completed_value(&self) -> Result<FenceValue>;

    /// Block the calling thread until the GPU reaches `value`. No timeout.
    fn wait(&self, value: FenceValue) -> Result<()>;
}

/// CPU side of the frame fence: owns the counter and the timeline.
pub struct FrameFence<T> {
    timeline: T,
    last_signaled: FenceValue,
}

impl<T: FenceTimeline> FrameFence<T> {
    pub fn new(timeline: T) -> Self {
        Self {
            timeline,
            last_signaled: 0,
        }
    }

    /// Increment the counter, signal it from the GPU queue and return it.
    pub fn signal_fence_from_gpu(&mut self) -> Result<FenceValue> {
        let value = self.last_signaled + 1;
        self.timeline.signal(value)?;
        self.last_signaled = value;
        log::trace!("Fence signal {}", value);
        Ok(value)
    }

    /// Returns immediately when `value` has already been reached, otherwise
    /// blocks until the GPU gets there.
    pub fn wait_for_fence_value(&self, value: FenceValue) -> Result<()> {
        if self.timeline.completed_value()? >= value {
            return Ok(());
        }
        log::trace!("Fence wait {}", value);
        self.timeline.wait(value)
    }

    /// Signal and wait: returns once all previously submitted work is done.
    pub fn flush(&mut self) -> Result<FenceValue> {
        let value = self.signal_fence_from_gpu()?;
        self.wait_for_fence_value(value)?;
        Ok(value)
    }

    pub fn is_complete(&self, value: FenceValue) -> Result<bool> {
        Ok(self.timeline.completed_value()? >= value)
    }

    pub fn completed_value(&self) -> Result<FenceValue> {
        self.timeline.completed_value()
    }

    pub fn last_signaled(&self) -> FenceValue {
        self.last_signaled
    }

    /// Value the next signal will carry. Work recorded into the open command
    /// list is complete once this value is reached.
    pub fn next_value(&self) -> FenceValue {
        self.last_signaled + 1
    }

    pub fn timeline(&self) -> &T {
        &self.timeline
    }
}

/// Per-slot record of the fence value that covers the slot's last submission.
#[derive(Debug, Clone)]
pub struct FrameSlots {
    values: Vec<FenceValue>,
}

impl FrameSlots {
    pub fn new(frame_count: usize) -> Self {
        Self {
            values: vec![0; frame_count],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, slot: usize) -> FenceValue {
        self.values[slot]
    }

    pub fn record(&mut self, slot: usize, value: FenceValue) {
        debug_assert!(value >= self.values[slot], "fence values must not go backwards");
        self.values[slot] = value;
    }
}
