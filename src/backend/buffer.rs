// GPU buffers and the depth image
//
// All memory comes from gpu-allocator. Placed buffers share one allocation
// that is freed when the last buffer placed in it is dropped.

use super::VulkanDevice;
use crate::error::{RenderError, Result};
use crate::gpu::{BufferDesc, BufferUsage, GpuAddress, GpuBuffer, HeapType};
use crate::resource::align_to;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

fn memory_location(heap: HeapType) -> MemoryLocation {
    match heap {
        HeapType::Upload => MemoryLocation::CpuToGpu,
        HeapType::Default => MemoryLocation::GpuOnly,
    }
}

pub fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::CONSTANT) || usage.contains(BufferUsage::UNORDERED_ACCESS) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    flags
}

// =============================================================================
// SHARED ALLOCATION
// =============================================================================

/// One gpu-allocator allocation, returned to the allocator on drop.
pub struct SharedAllocation {
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl SharedAllocation {
    fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|ptr| ptr.as_ptr().cast::<u8>())
    }
}

impl Drop for SharedAllocation {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::warn!("Failed to free GPU allocation: {}", e);
            }
        }
    }
}

// =============================================================================
// BUFFER
// =============================================================================

pub struct VulkanBuffer {
    pub raw: vk::Buffer,
    name: String,
    size: u64,
    heap: HeapType,
    address: GpuAddress,
    /// Offset of this buffer inside the shared allocation
    offset: u64,
    allocation: Arc<SharedAllocation>,
    device: Arc<VulkanDevice>,
}

impl VulkanBuffer {
    /// Create `descs` in order inside a single allocation.
    pub fn create_placed(device: &Arc<VulkanDevice>, descs: &[BufferDesc<'_>]) -> Result<Vec<Self>> {
        let Some(first) = descs.first() else {
            return Ok(Vec::new());
        };
        let heap = first.heap;

        let mut raws = Vec::with_capacity(descs.len());
        let destroy_all = |raws: &[vk::Buffer]| unsafe {
            for &raw in raws {
                device.device.destroy_buffer(raw, None);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // Create buffers and lay them out back to back
        // ─────────────────────────────────────────────────────────────────────
        let mut offsets = Vec::with_capacity(descs.len());
        let mut total = 0u64;
        let mut alignment = 1u64;
        let mut memory_type_bits = u32::MAX;
        for desc in descs {
            if desc.size == 0 {
                destroy_all(&raws);
                return Err(RenderError::ZeroSizedBuffer {
                    name: desc.name.to_string(),
                });
            }
            if desc.heap != heap {
                destroy_all(&raws);
                return Err(RenderError::Unsupported(format!(
                    "placed buffer `{}` is on a different heap than `{}`",
                    desc.name, first.name
                )));
            }

            let info = vk::BufferCreateInfo::builder()
                .size(desc.size)
                .usage(buffer_usage_flags(desc.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let raw = match unsafe { device.device.create_buffer(&info, None) } {
                Ok(raw) => raw,
                Err(e) => {
                    destroy_all(&raws);
                    return Err(e.into());
                }
            };
            raws.push(raw);

            let requirements = unsafe { device.device.get_buffer_memory_requirements(raw) };
            let mut buffer_alignment = requirements.alignment;
            if desc.usage.contains(BufferUsage::UNORDERED_ACCESS) {
                buffer_alignment = buffer_alignment.max(device.min_scratch_alignment);
            }
            let offset = align_to(total, buffer_alignment);
            offsets.push(offset);
            total = offset + requirements.size;
            alignment = alignment.max(buffer_alignment);
            memory_type_bits &= requirements.memory_type_bits;
        }

        // ─────────────────────────────────────────────────────────────────────
        // One allocation for all of them
        // ─────────────────────────────────────────────────────────────────────
        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: first.name,
            requirements: vk::MemoryRequirements {
                size: total,
                alignment,
                memory_type_bits,
            },
            location: memory_location(heap),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                destroy_all(&raws);
                return Err(e.into());
            }
        };

        for (&raw, &offset) in raws.iter().zip(&offsets) {
            let bound = unsafe {
                device
                    .device
                    .bind_buffer_memory(raw, allocation.memory(), allocation.offset() + offset)
            };
            if let Err(e) = bound {
                destroy_all(&raws);
                if let Err(free) = device.allocator.lock().free(allocation) {
                    log::error!("Failed to free allocation after bind error: {}", free);
                }
                return Err(e.into());
            }
        }

        let shared = Arc::new(SharedAllocation {
            allocation: Some(allocation),
            device: Arc::clone(device),
        });

        Ok(descs
            .iter()
            .zip(raws)
            .zip(offsets)
            .map(|((desc, raw), offset)| Self {
                raw,
                name: desc.name.to_string(),
                size: desc.size,
                heap,
                address: device.buffer_address(raw),
                offset,
                allocation: Arc::clone(&shared),
                device: Arc::clone(device),
            })
            .collect())
    }

    /// Copy `data` into the persistently mapped memory at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let base = self
            .allocation
            .mapped_ptr()
            .ok_or_else(|| RenderError::NotCpuWritable { name: self.name.clone() })?;
        if offset + data.len() as u64 > self.size {
            return Err(RenderError::BufferOverflow {
                name: self.name.clone(),
                offset,
                len: data.len() as u64,
                size: self.size,
            });
        }
        unsafe {
            let dst = base.add((self.offset + offset) as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

impl GpuBuffer for VulkanBuffer {
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

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.raw, None);
        }
    }
}

// =============================================================================
// DEPTH BUFFER
// =============================================================================

/// Depth image, its memory and view
pub struct DepthBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl DepthBuffer {
    pub fn new(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        // Create depth image
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }?;
        let mut depth = Self {
            image,
            view: vk::ImageView::null(),
            allocation: None,
            device: Arc::clone(device),
        };

        // Allocate memory
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "depth buffer",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::DedicatedImage(image),
        })?;
        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }?;
        depth.allocation = Some(allocation);

        // Create image view
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(depth_subresource_range());
        depth.view = unsafe { device.device.create_image_view(&view_info, None) }?;

        log::debug!("Created depth buffer {}x{}", extent.width, extent.height);
        Ok(depth)
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::warn!("Failed to free depth buffer memory: {}", e);
            }
        }
    }
}

pub fn depth_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_is_addressable_and_copyable() {
        let flags = buffer_usage_flags(BufferUsage::empty());
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn geometry_buffers_feed_acceleration_builds() {
        let flags = buffer_usage_flags(BufferUsage::VERTEX);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));

        let flags = buffer_usage_flags(BufferUsage::UNORDERED_ACCESS | BufferUsage::ACCELERATION_STRUCTURE);
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
