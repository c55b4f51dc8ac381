//! Vulkan surface management
//!
//! Handles window surface creation, present-queue selection and format
//! negotiation. The swapchain built on top lives in [`super::swapchain`].

use std::ffi::c_void;
use std::ptr::NonNull;

use ash::{extensions::khr, vk};
use raw_window_handle::{
    AndroidDisplayHandle, AndroidNdkWindowHandle, HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle,
    RawWindowHandle,
};

use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Borrowed `ANativeWindow` handed over by the platform bridge
///
/// The bridge keeps the window alive for as long as the surface exists.
#[derive(Debug, Clone, Copy)]
pub struct NativeWindow {
    window: NonNull<c_void>,
}

impl NativeWindow {
    /// Wrap a raw `ANativeWindow*`
    ///
    /// # Safety
    /// `window` must stay valid until every surface created from it is dropped.
    pub unsafe fn from_raw(window: *mut c_void) -> Option<Self> {
        NonNull::new(window).map(|window| Self { window })
    }

    /// Raw window pointer
    pub fn as_ptr(&self) -> *mut c_void {
        self.window.as_ptr()
    }
}

unsafe impl HasRawWindowHandle for NativeWindow {
    fn raw_window_handle(&self) -> RawWindowHandle {
        let mut handle = AndroidNdkWindowHandle::empty();
        handle.a_native_window = self.window.as_ptr();
        RawWindowHandle::AndroidNdk(handle)
    }
}

unsafe impl HasRawDisplayHandle for NativeWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        RawDisplayHandle::Android(AndroidDisplayHandle::empty())
    }
}

/// Pick the swapchain surface format
///
/// Prefers R8G8B8A8_UNORM. A single UNDEFINED entry means the surface has no
/// preference, which also selects R8G8B8A8_UNORM.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    match formats {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: only.color_space,
        }),
        _ => formats
            .iter()
            .find(|candidate| candidate.format == vk::Format::R8G8B8A8_UNORM)
            .or_else(|| formats.first())
            .copied(),
    }
}

/// Queue family to present from
///
/// A family with both graphics and present support wins; otherwise the first
/// family that can present.
pub fn select_present_queue_family(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<u32> {
    let presenting: Vec<u32> = (0..families.len() as u32).filter(|&index| supports_present(index)).collect();

    presenting
        .iter()
        .copied()
        .find(|&index| families[index as usize].queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| presenting.first().copied())
}

/// Vulkan surface wrapper for presentation
pub struct Surface {
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a new surface from a window
    pub fn new<W>(context: &DeviceContext, window: &W) -> VulkanResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let surface_loader = khr::Surface::new(context.entry(), context.instance());

        let surface = unsafe {
            ash_window::create_surface(
                context.entry(),
                context.instance(),
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create surface: {:?}", e)))?
        };

        Ok(Self {
            surface_loader,
            surface,
        })
    }

    /// Get the underlying surface handle
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(VulkanError::Api)
        }
    }

    /// Get surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(VulkanError::Api)
        }
    }

    /// Get surface present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(VulkanError::Api)
        }
    }

    /// Check if a queue family supports presentation to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family_index: u32) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, queue_family_index, self.surface)
                .unwrap_or(false)
        }
    }

    /// Make sure the device's queue family can present here and pick a format
    ///
    /// Only one queue is created, so a present-only family other than the
    /// device's own is reported as an initialization failure.
    pub fn negotiate(&self, context: &DeviceContext) -> VulkanResult<vk::SurfaceFormatKHR> {
        let physical_device = context.physical_device();
        let device_family = context.queue_family_index();

        let present_family = if self.supports_present(physical_device.device, device_family) {
            device_family
        } else {
            select_present_queue_family(&physical_device.queue_families, |index| {
                self.supports_present(physical_device.device, index)
            })
            .ok_or_else(|| VulkanError::InitializationFailed("No queue family can present to the surface".to_string()))?
        };

        if present_family != context.queue_family_index() {
            return Err(VulkanError::InitializationFailed(format!(
                "Presentation needs queue family {} but the device uses family {}",
                present_family,
                context.queue_family_index()
            )));
        }

        let formats = self.formats(physical_device.device)?;
        let format = choose_surface_format(&formats)
            .ok_or_else(|| VulkanError::InitializationFailed("Surface reports no formats".to_string()))?;

        log::info!(
            "Surface format {:?} / {:?} on queue family {}",
            format.format,
            format.color_space,
            present_family
        );
        Ok(format)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_rgba8() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        assert_eq!(choose_surface_format(&formats).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn test_single_undefined_entry_means_any() {
        let formats = [surface_format(vk::Format::UNDEFINED)];
        assert_eq!(choose_surface_format(&formats).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn test_falls_back_to_first_format() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        assert_eq!(choose_surface_format(&formats).map(|f| f.format), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_family_prefers_graphics() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_present_queue_family(&families, |_| true), Some(1));
        assert_eq!(select_present_queue_family(&families, |index| index == 0), Some(0));
        assert_eq!(select_present_queue_family(&families, |_| false), None);
    }

    #[test]
    fn test_native_window_handles() {
        let mut storage = 0u8;
        let window = unsafe { NativeWindow::from_raw((&mut storage as *mut u8).cast()) }.unwrap();

        match window.raw_window_handle() {
            RawWindowHandle::AndroidNdk(handle) => assert_eq!(handle.a_native_window, window.as_ptr()),
            other => panic!("unexpected handle {other:?}"),
        }
        assert!(matches!(window.raw_display_handle(), RawDisplayHandle::Android(_)));
        assert!(unsafe { NativeWindow::from_raw(std::ptr::null_mut()) }.is_none());
    }
}
