// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and surface extensions
// - Physical device selection (ray query capable, prefer discrete GPU)
// - Logical device + graphics queue with the ray-tracing feature chain
// - Memory allocator setup (buffer device addresses enabled)

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Device extensions the renderer cannot run without
fn required_device_extensions() -> [&'static CStr; 4] {
    [
        khr::Swapchain::name(),
        khr::AccelerationStructure::name(),
        khr::DeferredHostOperations::name(),
        vk::KhrRayQueryFn::name(),
    ]
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub acceleration_structure: khr::AccelerationStructure,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub min_scratch_alignment: u64,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        // Step 6: Cache device properties
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let properties = {
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut as_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
            properties2.properties
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Create memory allocator and extension loaders
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;
        let acceleration_structure = khr::AccelerationStructure::new(&instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            acceleration_structure,
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            min_scratch_alignment: u64::from(as_properties.min_acceleration_structure_scratch_offset_alignment),
        }))
    }

    fn surface_extensions(entry: &Entry) -> Result<Vec<*const c_char>> {
        let available = entry.enumerate_instance_extension_properties(None)?;
        let is_available = |name: &CStr| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        let mut extensions = vec![khr::Surface::name().as_ptr()];

        #[cfg(target_os = "windows")]
        extensions.push(khr::Win32Surface::name().as_ptr());

        #[cfg(all(unix, not(target_os = "macos")))]
        for name in [khr::XlibSurface::name(), khr::XcbSurface::name(), khr::WaylandSurface::name()] {
            if is_available(name) {
                extensions.push(name.as_ptr());
            }
        }

        if !is_available(khr::Surface::name()) {
            anyhow::bail!("VK_KHR_surface is not available");
        }
        Ok(extensions)
    }

    fn create_instance(entry: &Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("rt-renderer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = Self::surface_extensions(entry)?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if let Err(reason) = Self::check_ray_tracing_support(instance, device) {
                log::info!("Skipping {}: {}", name, reason);
                continue;
            }

            // Find graphics queue family
            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with ray query support found"))
    }

    /// Extensions and features the frame loop and acceleration structures rely on.
    fn check_ray_tracing_support(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<(), String> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(|e| format!("cannot enumerate extensions: {e}"))?;
        for required in required_device_extensions() {
            let found = available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == required);
            if !found {
                return Err(format!("missing {}", required.to_string_lossy()));
            }
        }

        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let core = {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut vk12)
                .push_next(&mut vk13)
                .push_next(&mut acceleration)
                .push_next(&mut ray_query);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
            features2.features
        };

        let checks = [
            (core.shader_int64, "shaderInt64"),
            (vk12.buffer_device_address, "bufferDeviceAddress"),
            (vk12.timeline_semaphore, "timelineSemaphore"),
            (vk12.descriptor_indexing, "descriptorIndexing"),
            (vk12.runtime_descriptor_array, "runtimeDescriptorArray"),
            (vk12.descriptor_binding_partially_bound, "descriptorBindingPartiallyBound"),
            (
                vk12.descriptor_binding_variable_descriptor_count,
                "descriptorBindingVariableDescriptorCount",
            ),
            (
                vk12.descriptor_binding_storage_buffer_update_after_bind,
                "descriptorBindingStorageBufferUpdateAfterBind",
            ),
            (
                vk12.descriptor_binding_update_unused_while_pending,
                "descriptorBindingUpdateUnusedWhilePending",
            ),
            (vk13.dynamic_rendering, "dynamicRendering"),
            (vk13.synchronization2, "synchronization2"),
            (acceleration.acceleration_structure, "accelerationStructure"),
            (ray_query.ray_query, "rayQuery"),
        ];
        match checks.iter().find(|(supported, _)| *supported != vk::TRUE) {
            Some((_, feature)) => Err(format!("feature {feature} not supported")),
            None => Ok(()),
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions: Vec<_> = required_device_extensions().iter().map(|name| name.as_ptr()).collect();

        // ─────────────────────────────────────────────────────────────────────
        // Feature chain: descriptor indexing, device addresses, timelines,
        // dynamic rendering, sync2, acceleration structures, ray queries
        // ─────────────────────────────────────────────────────────────────────
        let core = vk::PhysicalDeviceFeatures::builder().shader_int64(true).build();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true);
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut acceleration =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::builder().ray_query(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().features(core);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features2)
            .push_next(&mut vk12)
            .push_next(&mut vk13)
            .push_next(&mut acceleration)
            .push_next(&mut ray_query);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    pub fn buffer_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("Device wait before destroy failed: {}", e);
        }

        // Cleanup in reverse order
        unsafe {
            // Every allocation has been returned by now; the allocator must go
            // before the device it allocates from.
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
