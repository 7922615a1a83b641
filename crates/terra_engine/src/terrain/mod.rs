//! Streamed height-field terrain
//!
//! A [`Terrain`] keeps the regions around one centre region resident. Vertex
//! data is double buffered: [`Terrain::follow`] regenerates the proximity area
//! into the inactive buffer and swaps. Culling works on per-image indirect
//! command buffers that travel between the compute and graphics queues every
//! frame; see [`crate::render::ownership`].

pub mod layout;

pub use layout::{height_at, IndirectCommand, RegionBounds, TerrainLayout};

use ash::vk;

use crate::config::TerrainConfig;
use crate::foundation::math::Vec3;
use crate::render::layouts::SetLayouts;
use crate::render::ownership::{CommandBufferSink, QueueOwnership};
use crate::render::scene_data::FrustumUniform;
use crate::render::vulkan::{Buffer, CommandPool, DescriptorPool, VulkanContext, VulkanError, VulkanResult};

/// Shader-visible description of the resident area (set 1, binding 0)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainUniform {
    /// World x and z of the first region's origin, vertex spacing, height scale
    pub origin: [f32; 4],
    /// Region size, proximity width, vertices per region, region count
    pub dimensions: [u32; 4],
}

unsafe impl bytemuck::Zeroable for TerrainUniform {}
unsafe impl bytemuck::Pod for TerrainUniform {}

impl TerrainUniform {
    fn new(layout: &TerrainLayout, center: (i32, i32), spacing: f32, height_scale: f32) -> Self {
        let extent = layout.region_size as f32 * spacing;
        let radius = layout.proximity_radius as i32;
        Self {
            origin: [
                (center.0 - radius) as f32 * extent,
                (center.1 - radius) as f32 * extent,
                spacing,
                height_scale,
            ],
            dimensions: [
                layout.region_size,
                layout.proximity_width,
                layout.vertices_per_region,
                layout.region_count,
            ],
        }
    }
}

/// Handles a worker thread needs to record the terrain draw
#[derive(Debug, Clone, Copy)]
pub struct TerrainDrawData {
    /// Active vertex buffer
    pub vertex_buffer: vk::Buffer,
    /// Shared region index buffer
    pub index_buffer: vk::Buffer,
    /// Culled commands for this image
    pub indirect_buffer: vk::Buffer,
    /// Commands in the indirect buffer
    pub region_count: u32,
    /// Set 1
    pub terrain_set: vk::DescriptorSet,
}

/// Handles a worker thread needs to record the culling dispatch
#[derive(Debug, Clone, Copy)]
pub struct TerrainCullData {
    /// Frustum, bounds and commands
    pub cull_set: vk::DescriptorSet,
    /// Commands to cull
    pub region_count: u32,
}

struct TerrainFrame {
    indirect: Buffer,
    frustum: Buffer,
    uniform: Buffer,
    terrain_set: vk::DescriptorSet,
    cull_set: vk::DescriptorSet,
    ownership: QueueOwnership,
}

/// Per-image indirect, frustum and uniform buffers with their sets.
///
/// Every indirect buffer leaves here released to the compute queue.
fn create_frames(
    ctx: &VulkanContext,
    pool: &CommandPool,
    layouts: &SetLayouts,
    layout: &TerrainLayout,
    uniform: &TerrainUniform,
    bounds: &Buffer,
    image_count: usize,
) -> VulkanResult<(Vec<TerrainFrame>, DescriptorPool)> {
    let mut descriptor_pool = DescriptorPool::new();
    descriptor_pool.add_descriptor_layout(&layouts.terrain, 1);
    descriptor_pool.add_descriptor_layout(&layouts.cull, 1);
    descriptor_pool.init(ctx.device(), image_count as u32)?;

    let families = ctx.families();
    let commands = layout.indirect_commands();
    let mut frames = Vec::with_capacity(image_count);
    for _ in 0..image_count {
        let indirect = Buffer::from_bytes(
            ctx,
            bytemuck::cast_slice(&commands),
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let frustum = Buffer::host_visible(
            ctx,
            std::mem::size_of::<FrustumUniform>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let uniform_buffer = Buffer::from_bytes(ctx, bytemuck::bytes_of(uniform), vk::BufferUsageFlags::UNIFORM_BUFFER)?;

        let mut terrain_set = descriptor_pool.allocate(&layouts.terrain)?;
        terrain_set.set_buffer_desc(0, uniform_buffer.descriptor_info())?;
        terrain_set.update(ctx.device());

        let mut cull_set = descriptor_pool.allocate(&layouts.cull)?;
        cull_set.set_buffer_desc(0, frustum.descriptor_info())?;
        cull_set.set_buffer_desc(1, bounds.descriptor_info())?;
        cull_set.set_buffer_desc(2, indirect.descriptor_info())?;
        cull_set.update(ctx.device());

        let ownership = QueueOwnership::new(indirect.handle(), indirect.size(), families.graphics, families.compute);
        frames.push(TerrainFrame {
            indirect,
            frustum,
            uniform: uniform_buffer,
            terrain_set: terrain_set.handle(),
            cull_set: cull_set.handle(),
            ownership,
        });
    }

    // Hand every command buffer to compute so the first frame starts with an acquire
    let command_buffer = pool.begin_single_time_command()?;
    {
        let mut sink = CommandBufferSink::new(ctx.device(), command_buffer);
        for frame in &mut frames {
            frame.ownership.release_initial_to_compute(&mut sink)?;
        }
    }
    pool.end_single_time_command(command_buffer, ctx.graphics_queue())?;
    Ok((frames, descriptor_pool))
}

/// Resident terrain around a moving centre
pub struct Terrain {
    layout: TerrainLayout,
    spacing: f32,
    height_scale: f32,
    center: (i32, i32),
    vertex_buffers: [Buffer; 2],
    active: usize,
    index_buffer: Buffer,
    bounds: Buffer,
    frames: Vec<TerrainFrame>,
    _descriptor_pool: DescriptorPool,
}

impl Terrain {
    /// Generate the area around `position` and create per-image culling resources.
    ///
    /// Every indirect buffer leaves here released to the compute queue.
    pub fn new(
        ctx: &VulkanContext,
        pool: &CommandPool,
        layouts: &SetLayouts,
        config: &TerrainConfig,
        image_count: usize,
        position: Vec3,
    ) -> VulkanResult<Self> {
        let layout = TerrainLayout::from_config(config).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!(
                "terrain region_size {} with proximity_radius {} overflows the region constants",
                config.region_size, config.proximity_radius
            ),
        })?;
        let (spacing, height_scale) = (config.vertex_spacing, config.height_scale);
        let center = layout.region_of(&position, spacing);
        let (vertices, bounds) = layout::generate_proximity(&layout, center, spacing, height_scale);

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_size = vertex_bytes.len() as vk::DeviceSize;
        let vertex_buffers = [
            Buffer::host_visible(ctx, vertex_size, vk::BufferUsageFlags::VERTEX_BUFFER)?,
            Buffer::host_visible(ctx, vertex_size, vk::BufferUsageFlags::VERTEX_BUFFER)?,
        ];
        vertex_buffers[0].write(0, vertex_bytes)?;

        let index_buffer = Buffer::from_bytes(
            ctx,
            bytemuck::cast_slice(&layout.region_indices()),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let bounds = Buffer::from_bytes(ctx, bytemuck::cast_slice(&bounds), vk::BufferUsageFlags::STORAGE_BUFFER)?;

        let uniform = TerrainUniform::new(&layout, center, spacing, height_scale);
        let (frames, descriptor_pool) = create_frames(ctx, pool, layouts, &layout, &uniform, &bounds, image_count)?;

        log::info!(
            "Created terrain: {} regions of {}x{} quads around region {:?}",
            layout.region_count,
            layout.region_size,
            layout.region_size,
            center
        );

        Ok(Self {
            layout,
            spacing,
            height_scale,
            center,
            vertex_buffers,
            active: 0,
            index_buffer,
            bounds,
            frames,
            _descriptor_pool: descriptor_pool,
        })
    }

    /// Rebuild the per-image resources for a swapchain of `image_count` images.
    ///
    /// The device must be idle; the resident area is kept.
    pub fn resize_frames(
        &mut self,
        ctx: &VulkanContext,
        pool: &CommandPool,
        layouts: &SetLayouts,
        image_count: usize,
    ) -> VulkanResult<()> {
        let uniform = TerrainUniform::new(&self.layout, self.center, self.spacing, self.height_scale);
        // Sets go before the pool they came from
        self.frames.clear();
        let (frames, descriptor_pool) =
            create_frames(ctx, pool, layouts, &self.layout, &uniform, &self.bounds, image_count)?;
        self.frames = frames;
        self._descriptor_pool = descriptor_pool;
        log::debug!("Terrain frames rebuilt for {image_count} images");
        Ok(())
    }

    /// Region constants
    pub fn layout(&self) -> &TerrainLayout {
        &self.layout
    }

    /// Region the resident area is centred on
    pub fn center(&self) -> (i32, i32) {
        self.center
    }

    /// Re-centre on the region containing `position`.
    ///
    /// Returns `false` without any work when the region did not change.
    /// Otherwise regenerates on the CPU, idles the device, writes the inactive
    /// vertex buffer and the bounds, then swaps.
    pub fn follow(&mut self, ctx: &VulkanContext, position: Vec3) -> VulkanResult<bool> {
        let region = self.layout.region_of(&position, self.spacing);
        if region == self.center {
            return Ok(false);
        }

        let (vertices, bounds) = layout::generate_proximity(&self.layout, region, self.spacing, self.height_scale);
        let uniform = TerrainUniform::new(&self.layout, region, self.spacing, self.height_scale);

        ctx.wait_idle()?;
        let inactive = 1 - self.active;
        self.vertex_buffers[inactive].write_pod(&vertices)?;
        self.bounds.write_pod(&bounds)?;
        for frame in &self.frames {
            frame.uniform.write(0, bytemuck::bytes_of(&uniform))?;
        }
        self.active = inactive;

        log::debug!("Terrain moved from region {:?} to {:?}", self.center, region);
        self.center = region;
        Ok(true)
    }

    /// Write the culling frustum for `image`
    pub fn write_frustum(&self, image: usize, frustum: &FrustumUniform) -> VulkanResult<()> {
        self.frames[image].frustum.write(0, bytemuck::bytes_of(frustum))
    }

    /// Ownership state machine of `image`'s indirect buffer
    pub fn ownership_mut(&mut self, image: usize) -> &mut QueueOwnership {
        &mut self.frames[image].ownership
    }

    /// Snapshot for recording the draw on `image`
    pub fn draw_data(&self, image: usize) -> TerrainDrawData {
        let frame = &self.frames[image];
        TerrainDrawData {
            vertex_buffer: self.vertex_buffers[self.active].handle(),
            index_buffer: self.index_buffer.handle(),
            indirect_buffer: frame.indirect.handle(),
            region_count: self.layout.region_count,
            terrain_set: frame.terrain_set,
        }
    }

    /// Snapshot for recording the culling dispatch on `image`
    pub fn cull_data(&self, image: usize) -> TerrainCullData {
        TerrainCullData {
            cull_set: self.frames[image].cull_set,
            region_count: self.layout.region_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_origin_is_first_region_corner() {
        let layout = TerrainLayout::new(10, 2).unwrap();
        let uniform = TerrainUniform::new(&layout, (3, -1), 0.5, 4.0);
        // Region extent 5 units; first region is (1, -3)
        assert_eq!(uniform.origin, [5.0, -15.0, 0.5, 4.0]);
        assert_eq!(uniform.dimensions, [10, 5, 121, 25]);
        assert_eq!(std::mem::size_of::<TerrainUniform>(), 32);
    }
}
