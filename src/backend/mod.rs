// Backend module - Vulkan implementation of the `gpu` traits
//
// Design: Thin wrapper around ash + gpu-allocator with safety and ergonomics
// Hardware ray tracing: VK_KHR_acceleration_structure + VK_KHR_ray_query

pub mod accel;
pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::{ContextDesc, VulkanContext};
pub use device::VulkanDevice;
pub use pipeline::GraphicsPipeline;
pub use swapchain::Swapchain;
