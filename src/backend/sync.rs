// Synchronization primitives
//
// - TimelineFence: the frame fence, a timeline semaphore signaled by its own
//   queue submission after the work it covers
// - PresentSync: binary semaphores between acquire, render and present
//
// Acquire semaphores rotate through a spare: the next acquire always uses the
// spare, which is then swapped into the acquired image's slot. The fence
// paired with each acquire semaphore belongs to the submission that waited on
// it, so the spare is only reused once that wait has retired.

use super::VulkanDevice;
use crate::error::{RenderError, Result};
use crate::sync::{FenceTimeline, FenceValue};
use ash::vk;
use std::sync::Arc;

// =============================================================================
// FRAME FENCE
// =============================================================================

pub struct TimelineFence {
    semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineFence {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { device.device.create_semaphore(&info, None) }?;

        Ok(Self {
            semaphore,
            device: Arc::clone(device),
        })
    }
}

impl FenceTimeline for TimelineFence {
    fn signal(&self, value: FenceValue) -> Result<()> {
        let signal = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build();
        let submit = vk::SubmitInfo2::builder()
            .signal_semaphore_infos(std::slice::from_ref(&signal))
            .build();

        unsafe {
            self.device
                .device
                .queue_submit2(self.device.graphics_queue, &[submit], vk::Fence::null())
        }?;
        Ok(())
    }

    fn completed_value(&self) -> Result<FenceValue> {
        Ok(unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }?)
    }

    fn wait(&self, value: FenceValue) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);

        unsafe { self.device.device.wait_semaphores(&info, u64::MAX) }.map_err(|e| RenderError::FenceWait {
            value,
            reason: e.to_string(),
        })
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

// =============================================================================
// PRESENTATION
// =============================================================================

/// Semaphores and fences for one swapchain; one set per image.
pub struct PresentSync {
    pub image_available: Vec<vk::Semaphore>,
    /// Signaled by the frame submission that waited on `image_available`
    pub image_fences: Vec<vk::Fence>,
    pub render_finished: Vec<vk::Semaphore>,
    spare_semaphore: vk::Semaphore,
    spare_fence: vk::Fence,
}

impl PresentSync {
    pub fn new(device: &VulkanDevice, image_count: usize) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        let mut sync = Self {
            image_available: Vec::with_capacity(image_count),
            image_fences: Vec::with_capacity(image_count),
            render_finished: Vec::with_capacity(image_count),
            spare_semaphore: vk::Semaphore::null(),
            spare_fence: vk::Fence::null(),
        };

        let created = (|| -> Result<()> {
            unsafe {
                for _ in 0..image_count {
                    sync.image_available.push(device.device.create_semaphore(&semaphore_info, None)?);
                    sync.image_fences.push(device.device.create_fence(&fence_info, None)?);
                    sync.render_finished.push(device.device.create_semaphore(&semaphore_info, None)?);
                }
                sync.spare_semaphore = device.device.create_semaphore(&semaphore_info, None)?;
                sync.spare_fence = device.device.create_fence(&fence_info, None)?;
            }
            Ok(())
        })();

        match created {
            Ok(()) => Ok(sync),
            Err(e) => {
                sync.destroy(&device.device);
                Err(e)
            }
        }
    }

    /// Semaphore the next acquire signals. Blocks until the last submission
    /// that waited on it has retired.
    pub fn next_acquire_semaphore(&self, device: &ash::Device) -> Result<vk::Semaphore> {
        unsafe { device.wait_for_fences(&[self.spare_fence], true, u64::MAX) }?;
        Ok(self.spare_semaphore)
    }

    /// Hand the spare to `image`, taking back the image's previous pair.
    pub fn assign_acquired(&mut self, image: usize) {
        std::mem::swap(&mut self.spare_semaphore, &mut self.image_available[image]);
        std::mem::swap(&mut self.spare_fence, &mut self.image_fences[image]);
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            for &semaphore in self.image_available.iter().chain(&self.render_finished) {
                device.destroy_semaphore(semaphore, None);
            }
            for &fence in &self.image_fences {
                device.destroy_fence(fence, None);
            }
            if self.spare_semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(self.spare_semaphore, None);
            }
            if self.spare_fence != vk::Fence::null() {
                device.destroy_fence(self.spare_fence, None);
            }
        }
    }
}
