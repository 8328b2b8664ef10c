// Acceleration structures on VK_KHR_acceleration_structure
//
// The structure lives in a buffer the core allocated (default heap,
// ACCELERATION_STRUCTURE usage); this wrapper owns that buffer and the
// VkAccelerationStructureKHR handle placed in it.

use super::buffer::VulkanBuffer;
use super::VulkanDevice;
use crate::error::Result;
use crate::gpu::{
    AccelerationBuild, AccelerationBuildInputs, AccelerationGeometry, AccelerationLevel, AccelerationObject,
    BuildFlags, BuildMode, BuildPreference, BuildSizes, GpuAddress, GpuBuffer,
};
use ash::vk;
use std::sync::Arc;

pub struct VulkanAccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    level: AccelerationLevel,
    address: GpuAddress,
    buffer: VulkanBuffer,
    device: Arc<VulkanDevice>,
}

impl VulkanAccelerationStructure {
    pub fn new(device: &Arc<VulkanDevice>, level: AccelerationLevel, buffer: VulkanBuffer) -> Result<Self> {
        let info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.raw)
            .offset(0)
            .size(buffer.size())
            .ty(structure_type(level));
        let handle = unsafe { device.acceleration_structure.create_acceleration_structure(&info, None) }?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        let address = unsafe {
            device
                .acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        log::debug!("Created {:?}-level acceleration structure `{}`", level, buffer.name());
        Ok(Self {
            handle,
            level,
            address,
            buffer,
            device: Arc::clone(device),
        })
    }
}

impl AccelerationObject for VulkanAccelerationStructure {
    fn level(&self) -> AccelerationLevel {
        self.level
    }

    fn gpu_address(&self) -> GpuAddress {
        self.address
    }

    fn result_size(&self) -> u64 {
        self.buffer.size()
    }
}

impl Drop for VulkanAccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.device
                .acceleration_structure
                .destroy_acceleration_structure(self.handle, None);
        }
    }
}

// =============================================================================
// BUILD INPUTS
// =============================================================================

fn structure_type(level: AccelerationLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelerationLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_flags(flags: &BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = match flags.preference {
        BuildPreference::FastTrace => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        BuildPreference::FastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
    };
    if flags.allow_update {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    out
}

fn geometry(geometry: &AccelerationGeometry) -> vk::AccelerationStructureGeometryKHR {
    match geometry {
        AccelerationGeometry::Triangles(t) => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: t.vertex_address,
                })
                .vertex_stride(t.vertex_stride)
                .max_vertex(t.vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: t.index_address,
                })
                .build();
            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .build()
        }
        AccelerationGeometry::Instances { instance_address, .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: *instance_address,
                })
                .build();
            vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                .build()
        }
    }
}

/// Prebuild sizes for `inputs` on the device.
pub fn build_sizes(device: &VulkanDevice, inputs: &AccelerationBuildInputs) -> BuildSizes {
    let geometry = geometry(&inputs.geometry);
    let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(structure_type(inputs.geometry.level()))
        .flags(build_flags(&inputs.flags))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry));

    let sizes = unsafe {
        device.acceleration_structure.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            &[inputs.geometry.primitive_count()],
        )
    };

    BuildSizes {
        result_size: sizes.acceleration_structure_size,
        scratch_size: sizes.build_scratch_size,
        update_scratch_size: sizes.update_scratch_size,
    }
}

/// Record one build or in-place update into `cmd`.
pub fn record_build(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    build: &AccelerationBuild<'_, VulkanAccelerationStructure, VulkanBuffer>,
) {
    let geometry = geometry(&build.inputs.geometry);
    let (mode, source) = match (build.mode, build.source) {
        (BuildMode::Update, Some(source)) => (vk::BuildAccelerationStructureModeKHR::UPDATE, source.handle),
        (BuildMode::Update, None) => (vk::BuildAccelerationStructureModeKHR::UPDATE, build.destination.handle),
        (BuildMode::Build, _) => (
            vk::BuildAccelerationStructureModeKHR::BUILD,
            vk::AccelerationStructureKHR::null(),
        ),
    };

    let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(structure_type(build.inputs.geometry.level()))
        .flags(build_flags(&build.inputs.flags))
        .mode(mode)
        .src_acceleration_structure(source)
        .dst_acceleration_structure(build.destination.handle)
        .geometries(std::slice::from_ref(&geometry))
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: build.scratch.gpu_address(),
        })
        .build();

    let range = vk::AccelerationStructureBuildRangeInfoKHR {
        primitive_count: build.inputs.geometry.primitive_count(),
        primitive_offset: 0,
        first_vertex: 0,
        transform_offset: 0,
    };

    unsafe {
        device
            .acceleration_structure
            .cmd_build_acceleration_structures(cmd, &[info], &[&[range]]);
    }
}
