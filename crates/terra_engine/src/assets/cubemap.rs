//! Cube-mapped skybox

use std::path::Path;

use ash::vk;

use crate::assets::{AssetError, ImageData, ModelData};
use crate::render::layouts::SetLayouts;
use crate::render::vulkan::{Buffer, CommandPool, DescriptorPool, Texture, VulkanContext, VulkanError, VulkanResult};

/// Face order expected by Vulkan cube images
pub const FACE_NAMES: [&str; 6] = ["right", "left", "top", "bottom", "front", "back"];

/// Handles a worker thread needs to record one cube map
#[derive(Debug, Clone, Copy)]
pub struct CubeMapDrawData {
    /// Cube vertices
    pub vertex_buffer: vk::Buffer,
    /// Cube indices
    pub index_buffer: vk::Buffer,
    /// Indices to draw
    pub index_count: u32,
    /// Sampler set (set 1)
    pub texture_set: vk::DescriptorSet,
}

/// A cube texture with the geometry it is drawn on
pub struct CubeMap {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    texture_set: vk::DescriptorSet,
    _texture: Texture,
    _descriptor_pool: DescriptorPool,
}

impl CubeMap {
    /// Decode six face images named `<dir>/<face>.<extension>` in [`FACE_NAMES`] order
    pub fn load_faces(dir: impl AsRef<Path>, extension: &str) -> Result<[ImageData; 6], AssetError> {
        let dir = dir.as_ref();
        let faces = FACE_NAMES
            .iter()
            .map(|face| ImageData::load(dir.join(format!("{face}.{extension}"))))
            .collect::<Result<Vec<_>, _>>()?;
        faces
            .try_into()
            .map_err(|_| AssetError::Invalid("cube map needs six faces".to_string()))
    }

    /// Upload six equally sized square faces and a unit cube to draw them on
    pub fn new(ctx: &VulkanContext, pool: &CommandPool, layouts: &SetLayouts, faces: &[ImageData; 6]) -> VulkanResult<Self> {
        let (width, height) = (faces[0].width, faces[0].height);
        if width != height || faces.iter().any(|f| f.width != width || f.height != height) {
            return Err(VulkanError::InvalidOperation {
                reason: "cube map faces must be square and equally sized".to_string(),
            });
        }

        let layers: Vec<&[u8]> = faces.iter().map(|f| f.data.as_slice()).collect();
        let texture = Texture::from_rgba(ctx, pool, width, height, &layers)?;

        let cube = ModelData::cube(2.0, crate::assets::MaterialData::colored([1.0; 4]));
        let vertex_buffer = Buffer::from_bytes(ctx, bytemuck::cast_slice(&cube.vertices), vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer = Buffer::from_bytes(ctx, bytemuck::cast_slice(&cube.indices), vk::BufferUsageFlags::INDEX_BUFFER)?;

        let mut descriptor_pool = DescriptorPool::new();
        descriptor_pool.add_descriptor_layout(&layouts.cube_map, 1);
        descriptor_pool.init(ctx.device(), 1)?;
        let mut set = descriptor_pool.allocate(&layouts.cube_map)?;
        set.set_image_desc(0, texture.descriptor_info())?;
        set.update(ctx.device());

        log::info!("Created {width}x{width} cube map");
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: cube.indices.len() as u32,
            texture_set: set.handle(),
            _texture: texture,
            _descriptor_pool: descriptor_pool,
        })
    }

    /// Snapshot for recording
    pub fn draw_data(&self) -> CubeMapDrawData {
        CubeMapDrawData {
            vertex_buffer: self.vertex_buffer.handle(),
            index_buffer: self.index_buffer.handle(),
            index_count: self.index_count,
            texture_set: self.texture_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_faces_report_decode_error() {
        let err = CubeMap::load_faces("/nonexistent/skybox", "png").unwrap_err();
        assert!(matches!(err, AssetError::Decode(_)));
    }
}
