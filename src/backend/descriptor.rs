// Descriptor heaps on Vulkan
//
// CBV/SRV/UAV heap: one descriptor set holding a single partially bound,
// update-after-bind storage-buffer array. Slot N is array element N.
// Render-target and depth-stencil heaps have no Vulkan object behind them;
// they are CPU tables of image views consumed by dynamic rendering.

use super::VulkanDevice;
use crate::error::{RenderError, Result};
use crate::gpu::{DescriptorHandle, DescriptorKind};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Upper bound on the shader-visible array; each heap allocates its own count.
pub const MAX_SHADER_DESCRIPTORS: u32 = 65536;

/// Set layout shared by every shader-visible heap and the pipeline layout.
pub fn create_set_layout(device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(MAX_SHADER_DESCRIPTORS)
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .build();
    let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
        | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
    let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

    let info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(std::slice::from_ref(&binding))
        .push_next(&mut flags_info);

    Ok(unsafe { device.device.create_descriptor_set_layout(&info, None) }?)
}

enum HeapStorage {
    Set {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    Views(Mutex<Vec<vk::ImageView>>),
}

pub struct VulkanDescriptorHeap {
    name: String,
    kind: DescriptorKind,
    capacity: u32,
    storage: HeapStorage,
    device: Arc<VulkanDevice>,
}

impl VulkanDescriptorHeap {
    pub fn new(
        device: &Arc<VulkanDevice>,
        set_layout: vk::DescriptorSetLayout,
        name: &str,
        kind: DescriptorKind,
        capacity: u32,
    ) -> Result<Self> {
        let storage = match kind {
            DescriptorKind::CbvSrvUav => {
                if capacity > MAX_SHADER_DESCRIPTORS {
                    return Err(RenderError::InvalidDescriptorHeap {
                        heap: name.to_string(),
                        reason: "capacity exceeds the shader-visible array",
                    });
                }
                let pool_sizes = [vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: capacity,
                }];
                let pool_info = vk::DescriptorPoolCreateInfo::builder()
                    .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                    .max_sets(1)
                    .pool_sizes(&pool_sizes);
                let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }?;

                let counts = [capacity];
                let mut variable_count =
                    vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder().descriptor_counts(&counts);
                let layouts = [set_layout];
                let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts)
                    .push_next(&mut variable_count);
                let set = match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
                    Ok(sets) => sets[0],
                    Err(e) => {
                        unsafe { device.device.destroy_descriptor_pool(pool, None) };
                        return Err(e.into());
                    }
                };
                HeapStorage::Set { pool, set }
            }
            DescriptorKind::RenderTarget | DescriptorKind::DepthStencil => {
                HeapStorage::Views(Mutex::new(vec![vk::ImageView::null(); capacity as usize]))
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            capacity,
            storage,
            device: Arc::clone(device),
        })
    }

    fn check(&self, slot: DescriptorHandle, kind: DescriptorKind) -> Result<()> {
        if self.kind != kind {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: self.name.clone(),
                reason: "descriptor kind does not match the heap",
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

    pub fn write_storage_buffer(&self, slot: DescriptorHandle, buffer: vk::Buffer, offset: u64, size: u64) -> Result<()> {
        self.check(slot, DescriptorKind::CbvSrvUav)?;
        let HeapStorage::Set { set, .. } = &self.storage else {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: self.name.clone(),
                reason: "heap has no descriptor set",
            });
        };

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset,
            range: size,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(*set)
            .dst_binding(0)
            .dst_array_element(slot.index())
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    pub fn write_view(&self, slot: DescriptorHandle, kind: DescriptorKind, view: vk::ImageView) -> Result<()> {
        self.check(slot, kind)?;
        match &self.storage {
            HeapStorage::Views(views) => {
                views.lock()[slot.index() as usize] = view;
                Ok(())
            }
            HeapStorage::Set { .. } => Err(RenderError::InvalidDescriptorHeap {
                heap: self.name.clone(),
                reason: "image views need a render-target or depth-stencil heap",
            }),
        }
    }

    /// Image view stored in `slot`, if one has been written.
    pub fn view(&self, slot: DescriptorHandle) -> Option<vk::ImageView> {
        match &self.storage {
            HeapStorage::Views(views) => views
                .lock()
                .get(slot.index() as usize)
                .copied()
                .filter(|view| *view != vk::ImageView::null()),
            HeapStorage::Set { .. } => None,
        }
    }

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        match &self.storage {
            HeapStorage::Set { set, .. } => Some(*set),
            HeapStorage::Views(_) => None,
        }
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        if let HeapStorage::Set { pool, .. } = &self.storage {
            unsafe { self.device.device.destroy_descriptor_pool(*pool, None) };
        }
    }
}
