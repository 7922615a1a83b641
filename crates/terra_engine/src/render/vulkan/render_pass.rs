//! Render pass management

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// Index of the swapchain color attachment in the main pass
pub const COLOR_ATTACHMENT: u32 = 0;
/// Index of the depth attachment in the main pass
pub const DEPTH_ATTACHMENT: u32 = 1;

fn cleared_attachment(
    format: vk::Format,
    store_op: vk::AttachmentStoreOp,
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout,
        final_layout,
        ..Default::default()
    }
}

/// Color is presented afterwards; depth only lives for the pass and was
/// transitioned once at creation, so it never starts UNDEFINED.
fn main_attachments(color_format: vk::Format, depth_format: vk::Format) -> [vk::AttachmentDescription; 2] {
    [
        cleared_attachment(
            color_format,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ),
        cleared_attachment(
            depth_format,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
    ]
}

/// EXTERNAL -> subpass 0. The acquire semaphore is waited at
/// COLOR_ATTACHMENT_OUTPUT, so the clear may not start earlier.
fn main_dependency() -> vk::SubpassDependency {
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        dst_stage_mask: stages,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }
}

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
}

impl RenderPass {
    /// Create the pass every renderer's secondaries continue: swapchain color
    /// plus depth, a single subpass.
    pub fn new_main(device: &Device, color_format: vk::Format, depth_format: vk::Format) -> VulkanResult<Self> {
        let attachments = main_attachments(color_format, depth_format);
        let color_refs = [vk::AttachmentReference {
            attachment: COLOR_ATTACHMENT,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: DEPTH_ATTACHMENT,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build()];
        let dependencies = [main_dependency()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { device.create_render_pass(&create_info, None).map_err(VulkanError::Api)? };
        log::debug!("Created main render pass ({color_format:?} + {depth_format:?})");

        Ok(Self {
            device: device.clone(),
            render_pass,
        })
    }

    /// Raw handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.destroy_render_pass(self.render_pass, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_presented_and_depth_discarded() {
        let [color, depth] = main_attachments(vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(depth.initial_layout, depth.final_layout);
    }

    #[test]
    fn test_dependency_waits_on_color_output() {
        let dependency = main_dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert!(dependency.src_stage_mask.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(dependency.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }
}
