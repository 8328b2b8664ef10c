// Surface creation (platform-specific window connection)

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

/// Create a presentation surface for `window` and check the graphics queue
/// can present to it.
pub fn create_surface<W>(device: &VulkanDevice, surface_loader: &khr::Surface, window: &W) -> Result<vk::SurfaceKHR>
where
    W: HasWindowHandle + HasDisplayHandle,
{
    let window_handle = window.window_handle().context("Failed to get window handle")?.as_raw();
    let display_handle = window.display_handle().context("Failed to get display handle")?.as_raw();

    let surface = unsafe { create_platform_surface(device, display_handle, window_handle)? };

    // Verify the GPU supports presenting to this surface
    let surface_support = unsafe {
        surface_loader.get_physical_device_surface_support(device.physical_device, device.graphics_queue_family, surface)
    };
    match surface_support {
        Ok(true) => Ok(surface),
        Ok(false) => {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface")
        }
        Err(e) => {
            unsafe { surface_loader.destroy_surface(surface, None) };
            Err(e.into())
        }
    }
}

unsafe fn create_platform_surface(
    device: &VulkanDevice,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        #[cfg(target_os = "windows")]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder().hinstance(hinstance).hwnd(hwnd);
            let loader = khr::Win32Surface::new(&device.entry, &device.instance);
            Ok(loader.create_win32_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display.display.map_or(std::ptr::null_mut(), |d| d.as_ptr().cast());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder().dpy(dpy).window(handle.window);
            let loader = khr::XlibSurface::new(&device.entry, &device.instance);
            Ok(loader.create_xlib_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display.connection.map_or(std::ptr::null_mut(), |c| c.as_ptr().cast());
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(handle.window.get());
            let loader = khr::XcbSurface::new(&device.entry, &device.instance);
            Ok(loader.create_xcb_surface(&create_info, None)?)
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr().cast())
                .surface(handle.surface.as_ptr().cast());
            let loader = khr::WaylandSurface::new(&device.entry, &device.instance);
            Ok(loader.create_wayland_surface(&create_info, None)?)
        }

        _ => anyhow::bail!("Unsupported window handle type"),
    }
}
