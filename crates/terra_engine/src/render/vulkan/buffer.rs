//! Buffers, optionally owning their memory

use ash::{vk, Device};

use super::commands::CommandPool;
use super::context::{VulkanContext, VulkanError, VulkanResult};
use super::memory::Memory;

/// Host-visible, coherent memory for CPU-written buffers
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Buffer handle, usage and (when it owns one) its memory
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    // Declared after the handle so the buffer is destroyed before its memory is freed
    memory: Option<Memory>,
}

impl Buffer {
    /// Create an unbound buffer; bind it with [`Memory::bind_buffer`] or [`Memory::for_buffers`]
    pub fn new(device: &Device, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "Zero-sized buffer".to_string(),
            });
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VulkanError::Api)? };

        Ok(Self {
            device: device.clone(),
            buffer,
            size,
            usage,
            memory: None,
        })
    }

    /// Create a buffer with its own dedicated allocation
    pub fn with_memory(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let mut buffer = Self::new(ctx.device(), size, usage)?;
        let requirements = buffer.requirements();
        let memory = Memory::allocate(ctx, requirements.size, requirements.memory_type_bits, properties)?;
        memory.bind_buffer(&buffer, 0)?;
        buffer.memory = Some(memory);
        Ok(buffer)
    }

    /// Host-visible buffer the CPU writes directly
    pub fn host_visible(ctx: &VulkanContext, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VulkanResult<Self> {
        Self::with_memory(ctx, size, usage, HOST_MEMORY)
    }

    /// Host-visible buffer initialised with `bytes`
    pub fn from_bytes(ctx: &VulkanContext, bytes: &[u8], usage: vk::BufferUsageFlags) -> VulkanResult<Self> {
        let buffer = Self::host_visible(ctx, bytes.len() as vk::DeviceSize, usage)?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Memory requirements of the handle
    pub fn requirements(&self) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(self.buffer) }
    }

    /// Write through the buffer's own host-visible memory
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> VulkanResult<()> {
        match &self.memory {
            Some(memory) => memory.write(offset, bytes),
            None => Err(VulkanError::InvalidOperation {
                reason: "Buffer does not own its memory".to_string(),
            }),
        }
    }

    /// Write a slice of plain-old-data values at offset zero
    pub fn write_pod<T: bytemuck::Pod>(&self, data: &[T]) -> VulkanResult<()> {
        self.write(0, bytemuck::cast_slice(data))
    }

    /// Fill a device-local buffer by copying `bytes` through a temporary staging buffer.
    ///
    /// The buffer needs `TRANSFER_DST` usage; the copy is waited on before returning.
    pub fn upload_via_staging(
        &self,
        ctx: &VulkanContext,
        pool: &CommandPool,
        queue: vk::Queue,
        bytes: &[u8],
    ) -> VulkanResult<()> {
        let staging = Self::from_bytes(ctx, bytes, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let command_buffer = pool.begin_single_time_command()?;
        staging.copy_to(command_buffer, self, 0, 0, bytes.len() as vk::DeviceSize);
        pool.end_single_time_command(command_buffer, queue)
    }

    /// Record a copy of `size` bytes into `dst`
    pub fn copy_to(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: &Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device.cmd_copy_buffer(command_buffer, self.buffer, dst.buffer, &[region]);
        }
    }

    /// Whole-buffer descriptor info
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}
