// GPU buffers and memory-type selection
//
// Every buffer owns exactly one memory allocation, released on drop.

use ash::vk;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::VulkanDevice;

/// Find a suitable memory type index
///
/// Returns the lowest index whose bit is set in `type_bits` and whose property
/// flags include all of `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> BackendResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let has_type = (type_bits & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required);
            has_type && has_properties
        })
        .ok_or(BackendError::NoSuitableMemoryType { type_bits, required })
}

/// Allocate and bind memory satisfying `requirements`
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> BackendResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None)? };
    Ok(memory)
}

/// A buffer and its backing memory
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    device: Arc<VulkanDevice>,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory_flags", &self.memory_flags)
            .finish_non_exhaustive()
    }
}

impl GpuBuffer {
    /// Create a buffer with specified usage and memory properties
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> BackendResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(&device, requirements, memory_flags) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) };
        if let Err(e) = bound {
            unsafe {
                device.device.destroy_buffer(buffer, None);
                device.device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
            memory_flags,
            device,
        })
    }

    /// Host-visible, host-coherent buffer used as a transfer source
    pub fn staging(device: Arc<VulkanDevice>, size: vk::DeviceSize) -> BackendResult<Self> {
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Copy `data` into the start of a host-visible buffer
    pub fn write(&self, data: &[u8]) -> BackendResult<()> {
        debug_assert!(self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        debug_assert!(data.len() as vk::DeviceSize <= self.size);

        unsafe {
            let ptr = self.device.device.map_memory(
                self.memory,
                0,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )? as *mut u8;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Read the whole buffer back (host-visible memory only)
    pub fn read(&self) -> BackendResult<Vec<u8>> {
        debug_assert!(self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

        let mut out = vec![0u8; self.size as usize];
        unsafe {
            let ptr = self.device.device.map_memory(
                self.memory,
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            )? as *const u8;

            ptr.copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
            self.device.device.unmap_memory(self.memory);
        }

        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flags = vk::MemoryPropertyFlags;

    fn memory_properties(types: &[Flags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    fn typical_layout() -> vk::PhysicalDeviceMemoryProperties {
        memory_properties(&[
            Flags::DEVICE_LOCAL,
            Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
            Flags::HOST_VISIBLE | Flags::HOST_COHERENT | Flags::HOST_CACHED,
            Flags::DEVICE_LOCAL | Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
        ])
    }

    #[test]
    fn picks_lowest_matching_index() {
        let props = typical_layout();
        let host = Flags::HOST_VISIBLE | Flags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b1111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b1111, Flags::DEVICE_LOCAL).unwrap(), 0);
    }

    #[test]
    fn respects_type_mask() {
        let props = typical_layout();
        let host = Flags::HOST_VISIBLE | Flags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b1100, host).unwrap(), 2);
        assert_eq!(find_memory_type(&props, 0b1000, Flags::DEVICE_LOCAL).unwrap(), 3);
    }

    #[test]
    fn result_is_superset_with_bit_set() {
        let props = typical_layout();
        let requests = [
            Flags::empty(),
            Flags::DEVICE_LOCAL,
            Flags::HOST_VISIBLE,
            Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
            Flags::HOST_CACHED,
            Flags::DEVICE_LOCAL | Flags::HOST_VISIBLE,
        ];

        for mask in 0u32..16 {
            for &required in &requests {
                if let Ok(index) = find_memory_type(&props, mask, required) {
                    assert_ne!(mask & (1 << index), 0);
                    assert!(props.memory_types[index as usize]
                        .property_flags
                        .contains(required));
                }
            }
        }
    }

    #[test]
    fn no_match_is_an_error() {
        let props = typical_layout();

        let err = find_memory_type(&props, 0b0001, Flags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            BackendError::NoSuitableMemoryType { type_bits: 0b0001, .. }
        ));

        assert!(find_memory_type(&props, 0, Flags::empty()).is_err());
        assert!(find_memory_type(&props, 0b1111, Flags::LAZILY_ALLOCATED).is_err());
    }

    #[test]
    fn ignores_bits_beyond_type_count() {
        let props = memory_properties(&[Flags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 0b10, Flags::empty()).is_err());
    }
}
