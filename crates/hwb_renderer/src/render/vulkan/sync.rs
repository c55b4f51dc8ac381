//! Synchronization primitives
//!
//! Semaphores order device work (acquire → render → present) and fences let the
//! host know when a submission has retired. [`FrameSync`] holds the pair of
//! semaphores shared by every frame plus one fence per swapchain image.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Binary semaphore with RAII cleanup
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device
                .create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, fence })
    }

    /// Block until the fence signals or `timeout_ns` elapses
    ///
    /// A timeout is reported as [`VulkanError::Timeout`], never as success.
    pub fn wait(&self, timeout_ns: u64) -> VulkanResult<()> {
        let result = unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(VulkanError::Timeout {
                what: "fence",
                timeout_ns,
            }),
            Err(err) => Err(VulkanError::Api(err)),
        }
    }

    /// Whether the fence is currently signaled
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        unsafe { self.device.get_fence_status(self.fence).map_err(VulkanError::Api) }
    }

    /// Reset fence
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]).map_err(VulkanError::Api) }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Per-session frame synchronization objects
pub struct FrameSync {
    /// Signaled by the presentation engine when the acquired image is ready
    pub image_acquired: Semaphore,
    /// Signaled by the graphics queue when rendering into the image is done
    pub render_complete: Semaphore,
    /// One fence per swapchain image, created signaled
    pub fences: Vec<Fence>,
}

impl FrameSync {
    /// Create the semaphores and `image_count` signaled fences
    pub fn new(device: &Device, image_count: usize) -> VulkanResult<Self> {
        let image_acquired = Semaphore::new(device.clone())?;
        let render_complete = Semaphore::new(device.clone())?;
        let fences = (0..image_count)
            .map(|_| Fence::new(device.clone(), true))
            .collect::<VulkanResult<Vec<_>>>()?;

        Ok(Self {
            image_acquired,
            render_complete,
            fences,
        })
    }

    /// Fence guarding the given swapchain image index
    pub fn fence(&self, index: usize) -> VulkanResult<&Fence> {
        self.fences.get(index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("no fence for image index {} ({} fences)", index, self.fences.len()),
        })
    }
}
