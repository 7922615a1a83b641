//! Manually managed device memory
//!
//! Resources are created unbound and attached to a `Memory` at an offset, so
//! one allocation can back several buffers (a model's vertex and index data).

use ash::{vk, Device};

use super::buffer::Buffer;
use super::context::{VulkanContext, VulkanError, VulkanResult};

/// A single `vkAllocateMemory` allocation
pub struct Memory {
    device: Device,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    properties: vk::MemoryPropertyFlags,
}

impl Memory {
    /// Allocate `size` bytes from a type allowed by `type_bits` with `properties`
    pub fn allocate(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let memory_type_index = ctx.find_memory_type(type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { ctx.device().allocate_memory(&alloc_info, None).map_err(VulkanError::Api)? };

        Ok(Self {
            device: ctx.device().clone(),
            memory,
            size,
            properties,
        })
    }

    /// Allocate one block for `buffers`, bind each at an aligned offset and return the offsets
    pub fn for_buffers(
        ctx: &VulkanContext,
        buffers: &[&Buffer],
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(Self, Vec<vk::DeviceSize>)> {
        let requirements: Vec<vk::MemoryRequirements> = buffers.iter().map(|b| b.requirements()).collect();
        let packing = pack_allocations(&requirements).ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Buffers share no common memory type".to_string(),
        })?;

        let memory = Self::allocate(ctx, packing.size, packing.type_bits, properties)?;
        for (buffer, &offset) in buffers.iter().zip(&packing.offsets) {
            memory.bind_buffer(buffer, offset)?;
        }
        Ok((memory, packing.offsets))
    }

    /// Attach `buffer` at `offset`
    pub fn bind_buffer(&self, buffer: &Buffer, offset: vk::DeviceSize) -> VulkanResult<()> {
        unsafe {
            self.device
                .bind_buffer_memory(buffer.handle(), self.memory, offset)
                .map_err(VulkanError::Api)
        }
    }

    /// Attach `image` at `offset`
    pub fn bind_image(&self, image: vk::Image, offset: vk::DeviceSize) -> VulkanResult<()> {
        unsafe {
            self.device
                .bind_image_memory(image, self.memory, offset)
                .map_err(VulkanError::Api)
        }
    }

    /// Copy `bytes` into host-visible coherent memory at `offset`
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> VulkanResult<()> {
        // Mapped writes are never flushed, so coherence is required
        if !self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT) {
            return Err(VulkanError::InvalidOperation {
                reason: "Write to memory that is not host visible and coherent".to_string(),
            });
        }
        let len = bytes.len() as vk::DeviceSize;
        if offset + len > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Write of {len} bytes at {offset} overruns {} byte allocation", self.size),
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Allocation size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Raw handle
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Offsets and total size for packing several resources into one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packing {
    /// Offset of each resource, in input order
    pub offsets: Vec<vk::DeviceSize>,
    /// Total allocation size
    pub size: vk::DeviceSize,
    /// Memory types acceptable to every resource
    pub type_bits: u32,
}

/// Lay resources out back to back, honouring each one's alignment.
///
/// Returns `None` when the resources have no memory type in common.
pub fn pack_allocations(requirements: &[vk::MemoryRequirements]) -> Option<Packing> {
    let mut offsets = Vec::with_capacity(requirements.len());
    let mut size = 0;
    let mut type_bits = u32::MAX;

    for req in requirements {
        let offset = align_up(size, req.alignment);
        offsets.push(offset);
        size = offset + req.size;
        type_bits &= req.memory_type_bits;
    }

    (type_bits != 0).then_some(Packing { offsets, size, type_bits })
}

/// Round `value` up to a multiple of `alignment` (a power of two, or zero for none)
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(size: u64, alignment: u64, bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: bits,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(300, 0), 300);
    }

    #[test]
    fn test_pack_aligns_second_resource() {
        let packing = pack_allocations(&[req(100, 16, 0b11), req(64, 256, 0b10)]).unwrap();
        assert_eq!(packing.offsets, vec![0, 256]);
        assert_eq!(packing.size, 320);
        assert_eq!(packing.type_bits, 0b10);
    }

    #[test]
    fn test_pack_rejects_disjoint_memory_types() {
        assert!(pack_allocations(&[req(4, 4, 0b01), req(4, 4, 0b10)]).is_none());
    }
}
