//! Secondary command buffers recorded on one worker thread

use std::sync::Arc;

use ash::{vk, Device};

use crate::render::vulkan::commands::{begin_secondary_compute, begin_secondary_graphics, set_viewport_and_scissor};
use crate::render::vulkan::{CommandPool, InheritanceTarget, VulkanContext, VulkanError, VulkanResult};
use crate::threading::ThreadManager;

/// One secondary command buffer per swapchain image, filled by jobs on a fixed worker.
///
/// The main thread begins a buffer, queues jobs with [`Self::record`], and
/// ends it with [`Self::finish`] once the worker drained. Because the worker
/// runs jobs in order, no two jobs ever touch the buffer at once.
pub struct SecondaryRecorder {
    device: Device,
    threads: Arc<ThreadManager>,
    thread: usize,
    buffers: Vec<vk::CommandBuffer>,
    pool: CommandPool,
}

impl SecondaryRecorder {
    /// Allocate `image_count` secondaries from a new pool on `queue_family`
    pub fn new(
        ctx: &VulkanContext,
        threads: Arc<ThreadManager>,
        thread: usize,
        queue_family: u32,
        image_count: usize,
    ) -> VulkanResult<Self> {
        let pool = CommandPool::new(ctx.device(), queue_family)?;
        let buffers = pool.create_command_buffers(image_count as u32, vk::CommandBufferLevel::SECONDARY)?;
        Ok(Self {
            device: ctx.device().clone(),
            threads,
            thread,
            buffers,
            pool,
        })
    }

    fn buffer(&self, image: usize) -> VulkanResult<vk::CommandBuffer> {
        self.buffers
            .get(image)
            .copied()
            .ok_or(VulkanError::ResourceNotFound { id: image as u64 })
    }

    /// Begin `image`'s buffer inside `target` with a full-extent viewport
    pub fn begin_graphics(&self, image: usize, target: InheritanceTarget, extent: vk::Extent2D) -> VulkanResult<()> {
        let command_buffer = self.buffer(image)?;
        begin_secondary_graphics(&self.device, command_buffer, target)?;
        set_viewport_and_scissor(&self.device, command_buffer, extent);
        Ok(())
    }

    /// Begin `image`'s buffer for compute work
    pub fn begin_compute(&self, image: usize) -> VulkanResult<()> {
        begin_secondary_compute(&self.device, self.buffer(image)?)
    }

    /// Queue a recording job for `image`'s buffer
    pub fn record<F>(&self, image: usize, id: u64, job: F) -> VulkanResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) + Send + 'static,
    {
        let command_buffer = self.buffer(image)?;
        let device = self.device.clone();
        self.threads.add_work(self.thread, id, move || job(&device, command_buffer));
        Ok(())
    }

    /// Wait for the worker, then end `image`'s buffer
    pub fn finish(&self, image: usize) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self.buffer(image)?;
        self.threads.wait(self.thread);
        unsafe { self.device.end_command_buffer(command_buffer).map_err(VulkanError::Api)? };
        Ok(command_buffer)
    }
}

impl Drop for SecondaryRecorder {
    fn drop(&mut self) {
        self.threads.wait(self.thread);
        self.pool.free(&self.buffers);
    }
}
