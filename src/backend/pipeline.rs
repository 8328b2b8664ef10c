// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It renders with dynamic rendering (no render pass objects): color target
// is the swapchain format, depth is D32_SFLOAT, viewport and scissor are set
// per frame.
//
// PUSH CONSTANTS (80 bytes, vertex + fragment):
// ┌──────────────────────┬────────────────┬──────────────────┬─────────┐
// │ view_projection mat4 │ tlas u64       │ transform_index  │ padding │
// │ 0..64                │ 64..72         │ 72..76           │ 76..80  │
// └──────────────────────┴────────────────┴──────────────────┴─────────┘

use super::buffer::DEPTH_FORMAT;
use super::VulkanDevice;
use crate::error::Result;
use crate::scene::Vertex;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Frame-wide part of the push constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FramePushConstants {
    pub view_projection: [f32; 16],
    pub tlas_address: u64,
}

pub const TRANSFORM_INDEX_OFFSET: u32 = 72;
pub const PUSH_CONSTANT_SIZE: u32 = 80;
pub const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags =
    vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw());

/// Pipeline layout: the shader-visible descriptor set plus push constants.
pub fn create_pipeline_layout(device: &VulkanDevice, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
    let push_constant_range = vk::PushConstantRange::builder()
        .stage_flags(PUSH_CONSTANT_STAGES)
        .offset(0)
        .size(PUSH_CONSTANT_SIZE)
        .build();

    let set_layouts = [set_layout];
    let push_constant_ranges = [push_constant_range];
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    Ok(unsafe { device.device.create_pipeline_layout(&layout_info, None) }?)
}

/// Vertex input description for scene vertices (position + color + normal)
pub fn get_vertex_input_info() -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    // One binding for interleaved vertex data
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(Vertex::STRIDE as u32)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    // Position attribute (location 0)
    let position_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(0)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(0)
        .build();

    // Color attribute (location 1)
    let color_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(1)
        .format(vk::Format::R32G32B32A32_SFLOAT)
        .offset(12)
        .build();

    // Normal attribute (location 2)
    let normal_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(2)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(28)
        .build();

    (vec![binding], vec![position_attr, color_attr, normal_attr])
}

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    device: Arc<VulkanDevice>,
}

impl GraphicsPipeline {
    pub fn new(
        device: &Arc<VulkanDevice>,
        layout: vk::PipelineLayout,
        color_format: vk::Format,
        vert_shader: vk::ShaderModule,
        frag_shader: vk::ShaderModule,
    ) -> Result<Self> {
        // Shader stages
        let entry_point = c"main";

        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader)
            .name(entry_point)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader)
            .name(entry_point)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Vertex input
        let (bindings, attributes) = get_vertex_input_info();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic, only the counts are fixed
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Rasterization (floor quad and triangles are seen from both sides)
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        // Depth testing
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending (no blending, opaque)
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        // Dynamic rendering formats
        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(DEPTH_FORMAT);

        // Create pipeline
        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)?
        };

        log::info!("Created graphics pipeline ({:?})", color_format);
        Ok(Self {
            pipeline: pipelines[0],
            device: Arc::clone(device),
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_push_constants_end_where_the_transform_index_starts() {
        assert_eq!(std::mem::size_of::<FramePushConstants>() as u32, TRANSFORM_INDEX_OFFSET);
        assert!(TRANSFORM_INDEX_OFFSET + 4 <= PUSH_CONSTANT_SIZE);
    }

    #[test]
    fn vertex_attributes_match_the_vertex_layout() {
        let (bindings, attributes) = get_vertex_input_info();
        assert_eq!(bindings[0].stride, 40);
        assert_eq!(
            attributes.iter().map(|a| a.offset).collect::<Vec<_>>(),
            vec![
                std::mem::offset_of!(Vertex, position) as u32,
                std::mem::offset_of!(Vertex, color) as u32,
                std::mem::offset_of!(Vertex, normal) as u32,
            ]
        );
    }
}
