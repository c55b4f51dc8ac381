//! Buffer management for vertex data and uniforms
//!
//! [`BufferResource`] pairs a `vk::Buffer` with its own `vk::DeviceMemory`.
//! Host access goes through an explicit map/unmap window; copies outside that
//! window are rejected instead of writing through a dangling pointer.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use crate::render::vulkan::memory::needs_flush;
use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Host view of a mapped memory range
pub struct HostMapping {
    ptr: NonNull<u8>,
    offset: vk::DeviceSize,
    len: usize,
}

impl HostMapping {
    /// Wrap a pointer returned by `vkMapMemory`
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the mapping is alive.
    pub unsafe fn new(ptr: *mut c_void, offset: vk::DeviceSize, len: usize) -> VulkanResult<Self> {
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VulkanError::InvalidOperation {
            reason: "vkMapMemory returned a null pointer".to_string(),
        })?;
        Ok(Self { ptr, offset, len })
    }

    /// Offset of the mapping inside the allocation
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` to the start of the mapped range
    pub fn write(&mut self, data: &[u8]) -> VulkanResult<()> {
        if data.len() > self.len {
            return Err(VulkanError::InvalidOperation {
                reason: format!("copy of {} bytes exceeds mapped range of {} bytes", data.len(), self.len),
            });
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len()) };
        Ok(())
    }

    /// The mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Destination for per-frame uniform bytes
pub trait UniformSink {
    /// Replace the uniform contents with `bytes`
    fn write_uniforms(&mut self, bytes: &[u8]) -> VulkanResult<()>;
}

#[cfg(test)]
impl UniformSink for Vec<u8> {
    fn write_uniforms(&mut self, bytes: &[u8]) -> VulkanResult<()> {
        self.clear();
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Memory-backed linear buffer
pub struct BufferResource {
    context: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    mapping: Option<HostMapping>,
}

// The mapping pointer is only dereferenced through `&mut self` or `&self` borrows.
unsafe impl Send for BufferResource {}

impl BufferResource {
    /// Create a buffer and bind freshly allocated memory to it
    ///
    /// Either every step succeeds or nothing is left behind.
    pub fn create(
        context: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "buffer size must be non-zero".to_string(),
            });
        }

        let device = context.device();
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let bound = context
            .memory_type_index(requirements.memory_type_bits, memory_flags, false)
            .and_then(|memory_type_index| {
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type_index);
                let memory = unsafe { device.allocate_memory(&alloc_info, None).map_err(VulkanError::Api)? };
                if let Err(err) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
                    unsafe { device.free_memory(memory, None) };
                    return Err(VulkanError::Api(err));
                }
                Ok((memory, memory_type_index))
            });

        let (memory, memory_type_index) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        context.set_object_name(buffer, "buffer");
        context.set_object_name(memory, "buffer-memory");

        Ok(Self {
            context: Arc::clone(context),
            buffer,
            memory,
            size,
            memory_type_index,
            mapping: None,
        })
    }

    /// Create a DEVICE_LOCAL buffer filled with `data` through a staging copy
    pub fn create_device_local(
        context: &Arc<DeviceContext>,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let size = data.len() as vk::DeviceSize;

        let mut staging = Self::create(
            context,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.map(vk::WHOLE_SIZE, 0)?;
        staging.copy_from(data)?;
        staging.unmap()?;

        let target = Self::create(
            context,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let command_buffer = context.begin_single_time_command()?;
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            context
                .device()
                .cmd_copy_buffer(command_buffer, staging.handle(), target.handle(), &[region]);
        }
        context.end_and_submit_single_time_command(command_buffer, context.graphics_queue(), true)?;

        log::debug!("Uploaded {} bytes into device-local buffer", size);
        Ok(target)
    }

    /// Map `size` bytes starting at `offset`; `vk::WHOLE_SIZE` maps to the end
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.mapping.is_some() {
            return Err(VulkanError::InvalidState {
                operation: "map buffer",
                state: "already mapped".to_string(),
            });
        }
        let len = resolve_range(self.size, size, offset)?;

        let ptr = unsafe {
            self.context
                .device()
                .map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?
        };
        let len = usize::try_from(len).map_err(|_| VulkanError::InvalidOperation {
            reason: "mapped range exceeds host address space".to_string(),
        })?;

        match unsafe { HostMapping::new(ptr, offset, len) } {
            Ok(mapping) => {
                self.mapping = Some(mapping);
                Ok(())
            }
            Err(err) => {
                unsafe { self.context.device().unmap_memory(self.memory) };
                Err(err)
            }
        }
    }

    /// Release the host mapping
    pub fn unmap(&mut self) -> VulkanResult<()> {
        if self.mapping.take().is_none() {
            return Err(VulkanError::InvalidState {
                operation: "unmap buffer",
                state: "not mapped".to_string(),
            });
        }
        unsafe { self.context.device().unmap_memory(self.memory) };
        Ok(())
    }

    /// Copy `data` into the mapped range
    pub fn copy_from(&mut self, data: &[u8]) -> VulkanResult<()> {
        require_mapping(self.mapping.as_mut(), "copy into buffer")?.write(data)
    }

    /// Currently mapped bytes
    pub fn mapped_bytes(&self) -> VulkanResult<&[u8]> {
        self.mapping
            .as_ref()
            .map(HostMapping::as_slice)
            .ok_or_else(|| VulkanError::InvalidState {
                operation: "read buffer",
                state: "not mapped".to_string(),
            })
    }

    /// Whether the buffer is currently mapped
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Make host writes visible to the device (non-coherent memory)
    ///
    /// Only valid while mapped. The range is widened to the device's
    /// non-coherent atom size.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let range = self.mapped_range(size, offset, "flush buffer")?;
        unsafe {
            self.context
                .device()
                .flush_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Make device writes visible to the host (non-coherent memory)
    ///
    /// Only valid while mapped, widened like [`flush`](Self::flush).
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let range = self.mapped_range(size, offset, "invalidate buffer")?;
        unsafe {
            self.context
                .device()
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    fn mapped_range(
        &self,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        operation: &'static str,
    ) -> VulkanResult<vk::MappedMemoryRange> {
        let atom = self.context.physical_device().properties.limits.non_coherent_atom_size;
        let (offset, size) = aligned_flush_range(self.mapping.as_ref(), size, offset, atom, operation)?;
        Ok(vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build())
    }

    /// Whether host writes need an explicit [`flush`](Self::flush)
    pub fn requires_flush(&self) -> bool {
        needs_flush(self.context.memory_properties(), self.memory_type_index)
    }

    /// Descriptor info covering `size` bytes from `offset`
    pub fn descriptor(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get backing memory handle
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Get size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl UniformSink for BufferResource {
    fn write_uniforms(&mut self, bytes: &[u8]) -> VulkanResult<()> {
        self.map(bytes.len() as vk::DeviceSize, 0)?;
        let written = self.copy_from(bytes);
        let flushed = if written.is_ok() && self.requires_flush() {
            self.flush(vk::WHOLE_SIZE, 0)
        } else {
            Ok(())
        };
        self.unmap()?;
        written.and(flushed)
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            if self.mapping.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.free_memory(self.memory, None);
            device.destroy_buffer(self.buffer, None);
        }
    }
}

fn require_mapping<T>(mapping: Option<T>, operation: &'static str) -> VulkanResult<T> {
    mapping.ok_or_else(|| VulkanError::InvalidState {
        operation,
        state: "not mapped".to_string(),
    })
}

/// Offset and size to flush or invalidate for `[offset, offset + size)`
///
/// Offsets are relative to the allocation. The start is rounded down and the
/// end up to `atom`; a range reaching the end of the mapping becomes
/// `vk::WHOLE_SIZE`.
fn aligned_flush_range(
    mapping: Option<&HostMapping>,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    atom: vk::DeviceSize,
    operation: &'static str,
) -> VulkanResult<(vk::DeviceSize, vk::DeviceSize)> {
    let mapping = require_mapping(mapping, operation)?;
    let atom = atom.max(1);
    let mapped_start = mapping.offset();
    let mapped_end = mapped_start + mapping.len() as vk::DeviceSize;

    if offset < mapped_start {
        return Err(VulkanError::InvalidOperation {
            reason: format!("offset {} before mapped range at {}", offset, mapped_start),
        });
    }
    let len = resolve_range(mapped_end - mapped_start, size, offset - mapped_start)?;
    let end = offset + len;

    let start = offset / atom * atom;
    if start < mapped_start {
        return Err(VulkanError::InvalidOperation {
            reason: format!(
                "offset {} cannot be aligned to {} inside mapped range at {}",
                offset, atom, mapped_start
            ),
        });
    }
    let aligned_end = (end + atom - 1) / atom * atom;
    if aligned_end >= mapped_end {
        return Ok((start, vk::WHOLE_SIZE));
    }
    Ok((start, aligned_end - start))
}

/// Length in bytes of `[offset, offset + size)` inside a buffer of `total` bytes
fn resolve_range(total: vk::DeviceSize, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<vk::DeviceSize> {
    if offset >= total {
        return Err(VulkanError::InvalidOperation {
            reason: format!("offset {} outside buffer of {} bytes", offset, total),
        });
    }
    if size == vk::WHOLE_SIZE {
        return Ok(total - offset);
    }
    match offset.checked_add(size) {
        Some(end) if end <= total && size > 0 => Ok(size),
        _ => Err(VulkanError::InvalidOperation {
            reason: format!("range {}+{} outside buffer of {} bytes", offset, size, total),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host memory standing in for a device allocation
    struct FakeAllocation {
        bytes: Vec<u8>,
    }

    impl FakeAllocation {
        fn map(&mut self, offset: usize, len: usize) -> HostMapping {
            let ptr = self.bytes[offset..offset + len].as_mut_ptr().cast::<c_void>();
            unsafe { HostMapping::new(ptr, offset as vk::DeviceSize, len) }.unwrap()
        }
    }

    #[test]
    fn test_map_copy_unmap_round_trip() {
        let mut allocation = FakeAllocation { bytes: vec![0; 256] };

        for len in [1usize, 17, 128, 256] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();

            let mut mapping = allocation.map(0, 256);
            mapping.write(&data).unwrap();
            drop(mapping);

            let mapping = allocation.map(0, 256);
            assert_eq!(&mapping.as_slice()[..len], data.as_slice());
        }
    }

    #[test]
    fn test_copy_larger_than_mapping_rejected() {
        let mut allocation = FakeAllocation { bytes: vec![0; 64] };
        let mut mapping = allocation.map(32, 16);
        assert_eq!(mapping.offset(), 32);
        assert!(mapping.write(&[1; 17]).is_err());
        mapping.write(&[1; 16]).unwrap();
        drop(mapping);
        assert!(allocation.bytes[..32].iter().all(|&b| b == 0));
        assert!(allocation.bytes[32..48].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_null_mapping_rejected() {
        let mapping = unsafe { HostMapping::new(std::ptr::null_mut(), 0, 4) };
        assert!(matches!(mapping, Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(256, vk::WHOLE_SIZE, 0).unwrap(), 256);
        assert_eq!(resolve_range(256, vk::WHOLE_SIZE, 64).unwrap(), 192);
        assert_eq!(resolve_range(256, 64, 192).unwrap(), 64);
        assert!(resolve_range(256, 65, 192).is_err());
        assert!(resolve_range(256, 1, 256).is_err());
        assert!(resolve_range(256, 0, 0).is_err());
    }

    #[test]
    fn test_unmapped_host_access_rejected() {
        let mut unmapped: Option<HostMapping> = None;
        let copy = require_mapping(unmapped.as_mut(), "copy into buffer").and_then(|m| m.write(&[1, 2]));
        assert!(matches!(
            copy,
            Err(VulkanError::InvalidState {
                operation: "copy into buffer",
                ..
            })
        ));

        for operation in ["flush buffer", "invalidate buffer"] {
            let range = aligned_flush_range(None, vk::WHOLE_SIZE, 0, 64, operation);
            assert!(matches!(range, Err(VulkanError::InvalidState { operation: op, .. }) if op == operation));
        }
    }

    #[test]
    fn test_flush_range_aligned_to_atom() {
        let mut allocation = FakeAllocation { bytes: vec![0; 1024] };
        let mapping = allocation.map(0, 1024);

        // Partial ranges widen to whole atoms
        assert_eq!(aligned_flush_range(Some(&mapping), 10, 70, 64, "flush").unwrap(), (64, 64));
        assert_eq!(aligned_flush_range(Some(&mapping), 100, 0, 64, "flush").unwrap(), (0, 128));
        assert_eq!(aligned_flush_range(Some(&mapping), 1, 127, 64, "flush").unwrap(), (64, 64));

        // Reaching the end of the mapping flushes the rest of it
        assert_eq!(
            aligned_flush_range(Some(&mapping), 20, 1000, 64, "flush").unwrap(),
            (960, vk::WHOLE_SIZE)
        );
        assert_eq!(
            aligned_flush_range(Some(&mapping), vk::WHOLE_SIZE, 0, 64, "flush").unwrap(),
            (0, vk::WHOLE_SIZE)
        );

        // A zero atom behaves like byte granularity
        assert_eq!(aligned_flush_range(Some(&mapping), 3, 5, 0, "flush").unwrap(), (5, 3));

        assert!(aligned_flush_range(Some(&mapping), 64, 1000, 64, "flush").is_err());
    }

    #[test]
    fn test_flush_range_stays_inside_mapping() {
        let mut allocation = FakeAllocation { bytes: vec![0; 512] };
        let mapping = allocation.map(256, 128);

        assert_eq!(aligned_flush_range(Some(&mapping), 8, 260, 64, "flush").unwrap(), (256, 64));
        assert!(matches!(
            aligned_flush_range(Some(&mapping), 8, 200, 64, "flush"),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(aligned_flush_range(Some(&mapping), 8, 384, 64, "flush").is_err());
    }

    #[test]
    fn test_vec_uniform_sink_replaces_contents() {
        let mut sink = vec![9u8; 4];
        sink.write_uniforms(&[1, 2, 3]).unwrap();
        assert_eq!(sink, vec![1, 2, 3]);
    }
}
