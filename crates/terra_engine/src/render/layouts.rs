//! Descriptor set layouts shared between assets and renderers
//!
//! Set numbering used by the pipelines:
//! - models: 0 scene, 1 node, 2 material, 3 instance
//! - cube maps: 0 scene, 1 cube texture, 2 instance
//! - terrain: 0 scene, 1 terrain, 2 instance
//! - terrain culling: 0 cull

use ash::{vk, Device};

use crate::render::vulkan::{DescriptorLayout, VulkanResult};

/// Every layout except the per-renderer instance layouts
pub struct SetLayouts {
    /// Camera uniform buffer
    pub scene: DescriptorLayout,
    /// Node transform uniform buffer
    pub node: DescriptorLayout,
    /// Material uniform buffer and base color texture
    pub material: DescriptorLayout,
    /// Cube map sampler
    pub cube_map: DescriptorLayout,
    /// Terrain uniform buffer
    pub terrain: DescriptorLayout,
    /// Frustum uniform buffer, region bounds and indirect commands
    pub cull: DescriptorLayout,
}

impl SetLayouts {
    /// Create all layouts on `device`
    pub fn new(device: &Device) -> VulkanResult<Self> {
        use vk::DescriptorType as Ty;
        use vk::ShaderStageFlags as Stage;

        let mut scene = DescriptorLayout::new().with(Ty::UNIFORM_BUFFER, Stage::VERTEX | Stage::FRAGMENT);
        let mut node = DescriptorLayout::new().with(Ty::UNIFORM_BUFFER, Stage::VERTEX);
        let mut material = DescriptorLayout::new()
            .with(Ty::UNIFORM_BUFFER, Stage::FRAGMENT)
            .with(Ty::COMBINED_IMAGE_SAMPLER, Stage::FRAGMENT);
        let mut cube_map = DescriptorLayout::new().with(Ty::COMBINED_IMAGE_SAMPLER, Stage::FRAGMENT);
        let mut terrain = DescriptorLayout::new().with(Ty::UNIFORM_BUFFER, Stage::VERTEX | Stage::FRAGMENT);
        // Bounds and commands are adjacent storage buffers and flush as one write
        let mut cull = DescriptorLayout::new()
            .with(Ty::UNIFORM_BUFFER, Stage::COMPUTE)
            .with(Ty::STORAGE_BUFFER, Stage::COMPUTE)
            .with(Ty::STORAGE_BUFFER, Stage::COMPUTE);

        for layout in [&mut scene, &mut node, &mut material, &mut cube_map, &mut terrain, &mut cull] {
            layout.init(device)?;
        }

        Ok(Self {
            scene,
            node,
            material,
            cube_map,
            terrain,
            cull,
        })
    }
}
