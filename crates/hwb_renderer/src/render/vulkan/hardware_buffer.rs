//! Externally allocated hardware buffers
//!
//! The camera hands the renderer `AHardwareBuffer`s it allocated itself. The
//! renderer only ever needs two things from one: its description and the raw
//! pointer to chain into Vulkan import structures. [`ExternalBuffer`] captures
//! exactly that, so import code can be driven by a fake on the host.

use std::ffi::c_void;

/// `AHARDWAREBUFFER_FORMAT_*` values the renderer cares about
pub mod formats {
    /// 32-bit RGBA, 8 bits per channel
    pub const R8G8B8A8_UNORM: u32 = 0x01;
    /// 32-bit RGBX, alpha ignored
    pub const R8G8B8X8_UNORM: u32 = 0x02;
    /// 24-bit RGB
    pub const R8G8B8_UNORM: u32 = 0x03;
    /// 16-bit RGB 5:6:5
    pub const R5G6B5_UNORM: u32 = 0x04;
    /// Opaque 4:2:0 YCbCr, layout chosen by the producer
    pub const Y8CB8CR8_420: u32 = 0x23;
}

/// Description of a hardware buffer as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareBufferDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of array layers
    pub layers: u32,
    /// Platform pixel format (`AHARDWAREBUFFER_FORMAT_*`)
    pub format: u32,
    /// Platform usage bits
    pub usage: u64,
    /// Row stride in pixels
    pub stride: u32,
}

impl HardwareBufferDesc {
    /// Single-layer description with a tight stride
    pub fn new(width: u32, height: u32, format: u32) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format,
            usage: 0,
            stride: width,
        }
    }

    /// Whether the buffer covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.layers == 0
    }
}

/// A platform pixel buffer that can be imported into device memory
///
/// Implementations own one reference to the underlying buffer and release it
/// on drop.
pub trait ExternalBuffer: Send + Sync {
    /// Query the buffer description
    fn describe(&self) -> HardwareBufferDesc;

    /// Raw `AHardwareBuffer*` for Vulkan import structures
    fn as_raw(&self) -> *mut c_void;
}

#[cfg(target_os = "android")]
pub use android::HardwareBuffer;

#[cfg(target_os = "android")]
mod android {
    use std::ffi::c_void;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use super::{ExternalBuffer, HardwareBufferDesc};

    /// Counted reference to an `AHardwareBuffer`
    pub struct HardwareBuffer {
        buffer: NonNull<ndk_sys::AHardwareBuffer>,
    }

    impl HardwareBuffer {
        /// Take an additional reference to `buffer`
        ///
        /// # Safety
        /// `buffer` must be null or a live `AHardwareBuffer`.
        pub unsafe fn acquire(buffer: *mut c_void) -> Option<Self> {
            let buffer = NonNull::new(buffer.cast::<ndk_sys::AHardwareBuffer>())?;
            ndk_sys::AHardwareBuffer_acquire(buffer.as_ptr());
            Some(Self { buffer })
        }

        /// Adopt a reference the caller already owns
        ///
        /// # Safety
        /// `buffer` must be null or a live `AHardwareBuffer` whose reference
        /// count already accounts for this handle.
        pub unsafe fn from_owned(buffer: *mut c_void) -> Option<Self> {
            let buffer = NonNull::new(buffer.cast::<ndk_sys::AHardwareBuffer>())?;
            Some(Self { buffer })
        }
    }

    impl ExternalBuffer for HardwareBuffer {
        fn describe(&self) -> HardwareBufferDesc {
            let mut desc = MaybeUninit::<ndk_sys::AHardwareBuffer_Desc>::zeroed();
            let desc = unsafe {
                ndk_sys::AHardwareBuffer_describe(self.buffer.as_ptr(), desc.as_mut_ptr());
                desc.assume_init()
            };
            HardwareBufferDesc {
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
                format: desc.format,
                usage: desc.usage,
                stride: desc.stride,
            }
        }

        fn as_raw(&self) -> *mut c_void {
            self.buffer.as_ptr().cast()
        }
    }

    impl Clone for HardwareBuffer {
        fn clone(&self) -> Self {
            unsafe { ndk_sys::AHardwareBuffer_acquire(self.buffer.as_ptr()) };
            Self { buffer: self.buffer }
        }
    }

    impl Drop for HardwareBuffer {
        fn drop(&mut self) {
            unsafe { ndk_sys::AHardwareBuffer_release(self.buffer.as_ptr()) };
        }
    }

    // AHardwareBuffer reference counting and describe are thread-safe
    unsafe impl Send for HardwareBuffer {}
    unsafe impl Sync for HardwareBuffer {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Host-side buffer that only carries a description
    pub(crate) struct FakeHardwareBuffer {
        pub desc: HardwareBufferDesc,
        pub live: Arc<AtomicUsize>,
    }

    impl FakeHardwareBuffer {
        pub(crate) fn new(desc: HardwareBufferDesc) -> Self {
            Self::tracked(desc, Arc::new(AtomicUsize::new(0)))
        }

        pub(crate) fn tracked(desc: HardwareBufferDesc, live: Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self { desc, live }
        }
    }

    impl Drop for FakeHardwareBuffer {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ExternalBuffer for FakeHardwareBuffer {
        fn describe(&self) -> HardwareBufferDesc {
            self.desc
        }

        fn as_raw(&self) -> *mut c_void {
            (self as *const Self).cast_mut().cast()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_defaults() {
        let desc = HardwareBufferDesc::new(4032, 3024, formats::R8G8B8A8_UNORM);
        assert_eq!(desc.layers, 1);
        assert_eq!(desc.stride, 4032);
        assert!(!desc.is_empty());
        assert!(HardwareBufferDesc::new(0, 3024, formats::Y8CB8CR8_420).is_empty());
    }
}
