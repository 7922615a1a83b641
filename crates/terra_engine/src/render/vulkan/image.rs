//! Images with tracked layouts, samplers and textures

use ash::{vk, Device};

use super::buffer::Buffer;
use super::commands::CommandPool;
use super::context::{VulkanContext, VulkanError, VulkanResult};
use super::memory::Memory;

/// Creation parameters for [`Image`]
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Size of each layer
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect used for the view and barriers
    pub aspect: vk::ImageAspectFlags,
    /// Six layers viewed as a cube when set, one 2D layer otherwise
    pub cube: bool,
}

impl ImageDesc {
    /// Sampled RGBA8 texture
    pub fn texture(width: u32, height: u32, cube: bool) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            cube,
        }
    }

    /// Depth attachment
    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: match format {
                vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
                    vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
                }
                _ => vk::ImageAspectFlags::DEPTH,
            },
            cube: false,
        }
    }

    fn layers(&self) -> u32 {
        if self.cube {
            6
        } else {
            1
        }
    }
}

/// Device-local image with its view, backing memory and current layout
pub struct Image {
    device: Device,
    image: vk::Image,
    view: vk::ImageView,
    desc: ImageDesc,
    current_layout: vk::ImageLayout,
    _memory: Memory,
}

impl Image {
    /// Create the image, bind fresh device-local memory and create a view
    pub fn new(ctx: &VulkanContext, desc: ImageDesc) -> VulkanResult<Self> {
        let device = ctx.device();
        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers())
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { device.create_image(&image_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = Memory::allocate(
            ctx,
            requirements.size,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        memory.bind_image(image, 0)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(if desc.cube {
                vk::ImageViewType::CUBE
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(desc.format)
            .subresource_range(subresource_range(&desc));
        let view = unsafe { device.create_image_view(&view_info, None).map_err(VulkanError::Api)? };

        Ok(Self {
            device: device.clone(),
            image,
            view,
            desc,
            current_layout: vk::ImageLayout::UNDEFINED,
            _memory: memory,
        })
    }

    /// Record a barrier moving every layer to `new_layout` and remember the new layout
    pub fn transition_layout(&mut self, command_buffer: vk::CommandBuffer, new_layout: vk::ImageLayout) -> VulkanResult<()> {
        let masks = transition_masks(self.current_layout, new_layout).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("Unsupported layout transition {:?} -> {new_layout:?}", self.current_layout),
        })?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.current_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(subresource_range(&self.desc))
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        self.current_layout = new_layout;
        Ok(())
    }

    /// Record a copy of tightly packed layers from `buffer`, layer `i` at `i * layer_size`
    pub fn copy_from_buffer(&self, command_buffer: vk::CommandBuffer, buffer: &Buffer, layer_size: vk::DeviceSize) {
        let regions: Vec<vk::BufferImageCopy> = (0..self.desc.layers())
            .map(|layer| vk::BufferImageCopy {
                buffer_offset: vk::DeviceSize::from(layer) * layer_size,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: self.desc.aspect,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: self.desc.extent.width,
                    height: self.desc.extent.height,
                    depth: 1,
                },
            })
            .collect();

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                buffer.handle(),
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }
    }

    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// View over all layers
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Layout after the last recorded transition
    pub fn layout(&self) -> vk::ImageLayout {
        self.current_layout
    }

    /// Creation parameters
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
        }
    }
}

fn subresource_range(desc: &ImageDesc) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: desc.aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: desc.layers(),
    }
}

/// Access and stage masks for a layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Accesses made available before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses that wait on the transition
    pub dst_access: vk::AccessFlags,
    /// Stage the transition waits on
    pub src_stage: vk::PipelineStageFlags,
    /// Stage blocked until the transition completes
    pub dst_stage: vk::PipelineStageFlags,
}

/// Masks for the transitions the engine performs; `None` for anything else
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        _ => return None,
    };
    Some(masks)
}

/// Linear-filtering sampler
pub struct Sampler {
    device: Device,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Linear min/mag filtering with the given addressing
    pub fn new(device: &Device, address_mode: vk::SamplerAddressMode) -> VulkanResult<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        let sampler = unsafe { device.create_sampler(&create_info, None).map_err(VulkanError::Api)? };
        Ok(Self {
            device: device.clone(),
            sampler,
        })
    }

    /// Sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

/// Sampled image: image, view and sampler
pub struct Texture {
    image: Image,
    sampler: Sampler,
}

impl Texture {
    /// Upload RGBA8 pixels; `layers` holds one slice for 2D or six faces (+X, -X, +Y, -Y, +Z, -Z) for a cube
    pub fn from_rgba(
        ctx: &VulkanContext,
        pool: &CommandPool,
        width: u32,
        height: u32,
        layers: &[&[u8]],
    ) -> VulkanResult<Self> {
        let cube = match layers.len() {
            1 => false,
            6 => true,
            n => {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("Texture needs 1 or 6 layers, got {n}"),
                })
            }
        };
        let layer_size = u64::from(width) * u64::from(height) * 4;
        if layers.iter().any(|layer| layer.len() as u64 != layer_size) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Texture layer is not {width}x{height} RGBA8"),
            });
        }

        let staging_bytes: Vec<u8> = layers.concat();
        let staging = Buffer::from_bytes(ctx, &staging_bytes, vk::BufferUsageFlags::TRANSFER_SRC)?;

        let mut image = Image::new(ctx, ImageDesc::texture(width, height, cube))?;
        let command_buffer = pool.begin_single_time_command()?;
        image.transition_layout(command_buffer, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        image.copy_from_buffer(command_buffer, &staging, layer_size);
        image.transition_layout(command_buffer, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        pool.end_single_time_command(command_buffer, ctx.graphics_queue())?;

        let address_mode = if cube {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        } else {
            vk::SamplerAddressMode::REPEAT
        };
        let sampler = Sampler::new(ctx.device(), address_mode)?;

        Ok(Self { image, sampler })
    }

    /// 1x1 texture of a single color, used when a material has no image
    pub fn solid(ctx: &VulkanContext, pool: &CommandPool, rgba: [u8; 4]) -> VulkanResult<Self> {
        Self::from_rgba(ctx, pool, 1, 1, &[&rgba])
    }

    /// Descriptor info for a combined image sampler
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.handle(),
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Underlying image
    pub fn image(&self) -> &Image {
        &self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions_are_ordered_through_transfer() {
        let to_dst = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        let to_read =
            transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(to_dst.dst_stage, to_read.src_stage);
        assert_eq!(to_dst.dst_access, to_read.src_access);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_depth_transition_targets_fragment_tests() {
        let masks =
            transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert!(masks.dst_access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn test_unknown_transition_is_rejected() {
        assert!(transition_masks(vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::GENERAL).is_none());
    }
}
