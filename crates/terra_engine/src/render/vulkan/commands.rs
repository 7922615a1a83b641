//! Command pools and command buffer recording helpers

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Create a pool whose buffers can be individually reset
    pub fn new(device: &Device, queue_family_index: u32) -> VulkanResult<Self> {
        Self::with_flags(device, queue_family_index, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    /// Create a pool with explicit flags
    pub fn with_flags(
        device: &Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device: device.clone(),
            command_pool,
            queue_family_index,
        })
    }

    /// Allocate `count` buffers of the given level
    pub fn create_command_buffers(&self, count: u32, level: vk::CommandBufferLevel) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&alloc_info).map_err(VulkanError::Api) }
    }

    /// Return buffers to the pool
    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.command_pool, command_buffers) };
        }
    }

    /// Reset every buffer allocated from this pool
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    /// Allocate and begin a one-time-submit primary buffer
    pub fn begin_single_time_command(&self) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self
            .create_command_buffers(1, vk::CommandBufferLevel::PRIMARY)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Command buffer allocation returned nothing".to_string(),
            })?;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        Ok(command_buffer)
    }

    /// End, submit and wait for a buffer from [`Self::begin_single_time_command`], then free it
    pub fn end_single_time_command(&self, command_buffer: vk::CommandBuffer, queue: vk::Queue) -> VulkanResult<()> {
        let command_buffers = [command_buffer];
        let result = unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .and_then(|()| {
                    let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
                    self.device.queue_submit(queue, &[submit], vk::Fence::null())
                })
                .and_then(|()| self.device.queue_wait_idle(queue))
        };
        self.free(&command_buffers);
        result.map_err(VulkanError::Api)
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family the pool's buffers are submitted to
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Render pass and framebuffer a secondary buffer continues into
#[derive(Debug, Clone, Copy)]
pub struct InheritanceTarget {
    /// Render pass the primary buffer begins
    pub render_pass: vk::RenderPass,
    /// Framebuffer of the acquired image
    pub framebuffer: vk::Framebuffer,
    /// Subpass index
    pub subpass: u32,
}

/// Begin a secondary buffer that executes inside `target`'s render pass
pub fn begin_secondary_graphics(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    target: InheritanceTarget,
) -> VulkanResult<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::builder()
        .render_pass(target.render_pass)
        .subpass(target.subpass)
        .framebuffer(target.framebuffer);
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .inheritance_info(&inheritance);

    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)
    }
}

/// Begin a secondary buffer recorded outside any render pass (compute)
pub fn begin_secondary_compute(device: &Device, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::default();
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .inheritance_info(&inheritance);

    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)
    }
}

/// Begin a primary buffer for one frame
pub fn begin_primary(device: &Device, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)
    }
}

/// Set a full-extent viewport and scissor
pub fn set_viewport_and_scissor(device: &Device, command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[scissor]);
    }
}

/// Render pass instance whose contents are secondary command buffers; ends on drop
pub struct ActiveRenderPass<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> ActiveRenderPass<'a> {
    /// Begin `render_pass` on `framebuffer`, clearing color and depth
    pub fn begin(
        device: &'a Device,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> Self {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);

        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
        }
        Self { device, command_buffer }
    }

    /// Execute secondary buffers inside this render pass
    pub fn execute(&self, secondaries: &[vk::CommandBuffer]) {
        if !secondaries.is_empty() {
            unsafe { self.device.cmd_execute_commands(self.command_buffer, secondaries) };
        }
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.cmd_end_render_pass(self.command_buffer);
        }
    }
}
