//! Framebuffers and the shared depth attachment

use ash::{vk, Device};

use super::commands::CommandPool;
use super::context::{VulkanContext, VulkanError, VulkanResult};
use super::image::{Image, ImageDesc};

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
}

impl Framebuffer {
    /// Create a new framebuffer
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            device
                .create_framebuffer(&framebuffer_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device: device.clone(),
            framebuffer,
        })
    }

    /// Get the framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}

/// Depth attachment shared by every framebuffer
pub struct DepthBuffer {
    image: Image,
}

impl DepthBuffer {
    /// Create the depth image and move it to the attachment layout once
    pub fn new(ctx: &VulkanContext, pool: &CommandPool, extent: vk::Extent2D) -> VulkanResult<Self> {
        let format = ctx.find_depth_format()?;
        let mut image = Image::new(ctx, ImageDesc::depth(extent, format))?;

        let command_buffer = pool.begin_single_time_command()?;
        image.transition_layout(command_buffer, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
        pool.end_single_time_command(command_buffer, ctx.graphics_queue())?;

        log::debug!("Created {}x{} depth buffer ({:?})", extent.width, extent.height, format);
        Ok(Self { image })
    }

    /// Image view used as framebuffer attachment 1
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Depth format
    pub fn format(&self) -> vk::Format {
        self.image.desc().format
    }
}
