//! Vulkan swapchain management

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::vk;
use ash::Device;

use super::context::{VulkanContext, VulkanError, VulkanResult};

/// Swapchain wrapper owning the presentable images' views
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, replacing `old` when one is given.
    ///
    /// `desired_image_count` pins the image count across recreation; the first
    /// creation passes `None` and gets one image above the surface minimum.
    pub fn new(
        ctx: &VulkanContext,
        window_extent: vk::Extent2D,
        desired_image_count: Option<u32>,
        old: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let device = ctx.device().clone();
        let loader = SwapchainLoader::new(ctx.instance(), &device);
        let physical = ctx.physical_device().device;
        let surface = ctx.surface();
        let surface_loader = ctx.surface_loader();

        let (caps, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical, surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_formats(physical, surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical, surface)
                    .map_err(VulkanError::Api)?,
            )
        };

        let format = formats
            .iter()
            .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| VulkanError::InitializationFailed("Surface reports no formats".to_string()))?;

        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps, desired_image_count);

        let families = ctx.families();
        let family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);
        create_info = if families.graphics == families.present {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None).map_err(VulkanError::Api)? };
        let images = unsafe { loader.get_swapchain_images(swapchain).map_err(VulkanError::Api)? };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            image_views.push(unsafe { device.create_image_view(&view_info, None).map_err(VulkanError::Api)? });
        }

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        Ok(Self {
            device,
            loader,
            swapchain,
            images,
            image_views,
            format,
            extent,
        })
    }

    /// Acquire the next image; the bool is the suboptimal flag
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        }
    }

    /// Present `image_index` after `wait`; the bool is the suboptimal flag
    pub fn present(&self, queue: vk::Queue, wait: vk::Semaphore, image_index: u32) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.loader.queue_present(queue, &present_info) }
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Color format
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// One view per presentable image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: Option<u32>) -> u32 {
    // At least two images so that one frame can be in flight
    let wanted = desired.unwrap_or(caps.min_image_count + 1).max(caps.min_image_count).max(2);
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_image_count_is_one_above_minimum() {
        assert_eq!(choose_image_count(&caps(2, 8), None), 3);
        assert_eq!(choose_image_count(&caps(3, 3), None), 3);
        assert_eq!(choose_image_count(&caps(2, 0), None), 3);
    }

    #[test]
    fn test_image_count_keeps_desired_within_limits() {
        assert_eq!(choose_image_count(&caps(2, 8), Some(4)), 4);
        assert_eq!(choose_image_count(&caps(2, 3), Some(6)), 3);
        assert_eq!(choose_image_count(&caps(1, 0), Some(1)), 2);
    }

    #[test]
    fn test_extent_is_clamped_when_surface_defers_to_window() {
        let extent = choose_extent(&caps(2, 3), vk::Extent2D { width: 10_000, height: 0 });
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn test_extent_uses_surface_size_when_fixed() {
        let mut fixed = caps(2, 3);
        fixed.current_extent = vk::Extent2D { width: 800, height: 600 };
        let extent = choose_extent(&fixed, vk::Extent2D { width: 1, height: 1 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }
}
