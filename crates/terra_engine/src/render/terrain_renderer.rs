//! GPU-culled terrain drawing
//!
//! Per image the renderer fills two secondaries on the terrain worker: a
//! compute one that culls every live terrain's regions against the frustum,
//! and a graphics one that draws the surviving regions indirectly. The
//! orchestrator wraps them with the ownership hooks below, compute first.

use std::sync::Arc;

use ash::vk;

use crate::config::RendererConfig;
use crate::foundation::collections::{key_id, SlotMap, TerrainKey};
use crate::foundation::math::Mat4;
use crate::render::frame::FrameStage;
use crate::render::instancing::InstanceBatcher;
use crate::render::layouts::SetLayouts;
use crate::render::ownership::{CommandBufferSink, ComputeAcquired, GraphicsAcquired};
use crate::render::recorder::SecondaryRecorder;
use crate::render::scene_data::{FrustumUniform, RenderInheritanceData};
use crate::render::vertex::Vertex;
use crate::render::vulkan::pipeline::VertexInput;
use crate::render::vulkan::{
    ComputePipeline, GraphicsPipeline, InheritanceTarget, PipelineConfig, VulkanContext, VulkanResult,
};
use crate::terrain::{IndirectCommand, Terrain};
use crate::threading::{ThreadManager, TERRAIN_THREAD};

/// Invocations per culling workgroup; must match the compute shader
pub const CULL_WORKGROUP_SIZE: u32 = 64;

/// Workgroups needed to cull `region_count` regions
pub fn cull_workgroups(region_count: u32) -> u32 {
    region_count.div_ceil(CULL_WORKGROUP_SIZE)
}

/// Secondaries produced for one frame
#[derive(Debug, Clone, Copy)]
pub struct TerrainCommands {
    /// Executed inside the main render pass
    pub graphics: vk::CommandBuffer,
    /// Culling work; `None` when no terrain was drawn and compute must not be submitted
    pub compute: Option<vk::CommandBuffer>,
}

/// Draws terrains with compute-culled indirect commands
pub struct TerrainRenderer {
    ctx: Arc<VulkanContext>,
    batcher: InstanceBatcher<TerrainKey>,
    pipeline: GraphicsPipeline,
    cull_pipeline: ComputePipeline,
    graphics: SecondaryRecorder,
    compute: SecondaryRecorder,
    scene_sets: Vec<vk::DescriptorSet>,
    extent: vk::Extent2D,
    recorded: Vec<Vec<TerrainKey>>,
}

impl TerrainRenderer {
    /// Build the terrain pipeline and the culling compute pipeline
    pub fn new(
        ctx: Arc<VulkanContext>,
        threads: Arc<ThreadManager>,
        config: &RendererConfig,
        layouts: &SetLayouts,
        inheritance: &RenderInheritanceData,
    ) -> VulkanResult<Self> {
        let image_count = inheritance.image_count;
        let batcher = InstanceBatcher::new(ctx.device(), "terrain", image_count)?;

        let pipeline_config = PipelineConfig::new(
            config.shader_path(&config.terrain_vertex),
            config.shader_path(&config.terrain_fragment),
        )
        .with_vertex_input(VertexInput {
            bindings: Vertex::binding_descriptions(),
            attributes: Vertex::attribute_descriptions(),
        });
        let set_layouts = [inheritance.scene_layout, layouts.terrain.handle(), batcher.instance_layout()];
        let pipeline = GraphicsPipeline::new(ctx.device(), inheritance.render_pass, &pipeline_config, &set_layouts, &[])?;

        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<u32>() as u32,
        };
        let cull_pipeline = ComputePipeline::new(
            ctx.device(),
            config.shader_path(&config.terrain_cull),
            &[layouts.cull.handle()],
            &[push_range],
        )?;

        let families = ctx.families();
        let graphics = SecondaryRecorder::new(&ctx, Arc::clone(&threads), TERRAIN_THREAD, families.graphics, image_count)?;
        let compute = SecondaryRecorder::new(&ctx, threads, TERRAIN_THREAD, families.compute, image_count)?;

        if !ctx.supports_multi_draw_indirect() {
            log::warn!("multiDrawIndirect unsupported; terrain regions are drawn one indirect call each");
        }

        Ok(Self {
            ctx,
            batcher,
            pipeline,
            cull_pipeline,
            graphics,
            compute,
            scene_sets: inheritance.scene_sets.clone(),
            extent: inheritance.extent,
            recorded: vec![Vec::new(); image_count],
        })
    }

    /// Queue `terrain` with the given transform
    pub fn draw_terrain(&mut self, image: usize, key: TerrainKey, _terrain: &Terrain, transform: &Mat4) -> VulkanResult<()> {
        self.batcher
            .draw(&self.ctx, image, key_id(key), key, std::slice::from_ref(transform))?;
        Ok(())
    }

    /// Record culling and drawing for every terrain drawn this frame.
    ///
    /// `frustum` is moved into each terrain's object space and written into its
    /// per-image uniform, since region bounds are stored untransformed.
    pub fn end(
        &mut self,
        image: usize,
        terrains: &SlotMap<TerrainKey, Terrain>,
        frustum: &FrustumUniform,
    ) -> VulkanResult<TerrainCommands> {
        self.batcher.prepare(image)?;

        let pipeline = self.pipeline.handle();
        let layout = self.pipeline.layout();
        let cull_pipeline = self.cull_pipeline.handle();
        let cull_layout = self.cull_pipeline.layout();
        let scene_set = self.scene_sets[image];
        let multi_draw = self.ctx.supports_multi_draw_indirect();

        let recorded = &mut self.recorded[image];
        recorded.clear();
        for draw in self.batcher.live(image) {
            let Some(terrain) = terrains.get(draw.handle) else {
                continue;
            };
            terrain.write_frustum(image, &frustum.to_local_space(&draw.transform))?;
            recorded.push(draw.handle);

            let cull = terrain.cull_data(image);
            self.compute.record(image, draw.id, move |device, command_buffer| unsafe {
                device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, cull_pipeline);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    cull_layout,
                    0,
                    &[cull.cull_set],
                    &[],
                );
                device.cmd_push_constants(
                    command_buffer,
                    cull_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &cull.region_count.to_ne_bytes(),
                );
                device.cmd_dispatch(command_buffer, cull_workgroups(cull.region_count), 1, 1);
            })?;

            let data = terrain.draw_data(image);
            self.graphics.record(image, draw.id, move |device, command_buffer| unsafe {
                device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &[scene_set, data.terrain_set, draw.instance_set],
                    &[],
                );
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[data.vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(command_buffer, data.index_buffer, 0, vk::IndexType::UINT32);

                let stride = std::mem::size_of::<IndirectCommand>() as u32;
                if multi_draw {
                    device.cmd_draw_indexed_indirect(command_buffer, data.indirect_buffer, 0, data.region_count, stride);
                } else {
                    for region in 0..data.region_count {
                        let offset = vk::DeviceSize::from(region * stride);
                        device.cmd_draw_indexed_indirect(command_buffer, data.indirect_buffer, offset, 1, stride);
                    }
                }
            })?;
        }

        let graphics = self.graphics.finish(image)?;
        let compute = self.compute.finish(image)?;
        Ok(TerrainCommands {
            graphics,
            compute: (!self.recorded[image].is_empty()).then_some(compute),
        })
    }

    /// Acquire this frame's indirect buffers on the compute queue, before the culling secondary
    pub fn pre_record_compute(
        &self,
        image: usize,
        command_buffer: vk::CommandBuffer,
        terrains: &mut SlotMap<TerrainKey, Terrain>,
    ) -> VulkanResult<Vec<(TerrainKey, ComputeAcquired)>> {
        let mut sink = CommandBufferSink::new(self.ctx.device(), command_buffer);
        let mut acquired = Vec::with_capacity(self.recorded[image].len());
        for &key in &self.recorded[image] {
            if let Some(terrain) = terrains.get_mut(key) {
                acquired.push((key, terrain.ownership_mut(image).acquire_for_compute(&mut sink)?));
            }
        }
        Ok(acquired)
    }

    /// Release the culled buffers to graphics, after the culling secondary
    pub fn post_record_compute(
        &self,
        image: usize,
        command_buffer: vk::CommandBuffer,
        terrains: &mut SlotMap<TerrainKey, Terrain>,
        acquired: Vec<(TerrainKey, ComputeAcquired)>,
    ) -> VulkanResult<()> {
        let mut sink = CommandBufferSink::new(self.ctx.device(), command_buffer);
        for (key, proof) in acquired {
            if let Some(terrain) = terrains.get_mut(key) {
                terrain.ownership_mut(image).release_to_graphics(&mut sink, proof)?;
            }
        }
        Ok(())
    }

    /// Acquire the culled buffers on the graphics queue, before the render pass
    pub fn pre_record_graphics(
        &self,
        image: usize,
        command_buffer: vk::CommandBuffer,
        terrains: &mut SlotMap<TerrainKey, Terrain>,
    ) -> VulkanResult<Vec<(TerrainKey, GraphicsAcquired)>> {
        let mut sink = CommandBufferSink::new(self.ctx.device(), command_buffer);
        let mut acquired = Vec::with_capacity(self.recorded[image].len());
        for &key in &self.recorded[image] {
            if let Some(terrain) = terrains.get_mut(key) {
                acquired.push((key, terrain.ownership_mut(image).acquire_for_graphics(&mut sink)?));
            }
        }
        Ok(acquired)
    }

    /// Hand the buffers back to compute, after the render pass
    pub fn post_record_graphics(
        &self,
        image: usize,
        command_buffer: vk::CommandBuffer,
        terrains: &mut SlotMap<TerrainKey, Terrain>,
        acquired: Vec<(TerrainKey, GraphicsAcquired)>,
    ) -> VulkanResult<()> {
        let mut sink = CommandBufferSink::new(self.ctx.device(), command_buffer);
        for (key, proof) in acquired {
            if let Some(terrain) = terrains.get_mut(key) {
                terrain.ownership_mut(image).release_to_compute(&mut sink, proof)?;
            }
        }
        Ok(())
    }

    /// Adopt new scene sets and extent; every batch is rebuilt on its image's next frame
    pub fn update_inheritance(&mut self, inheritance: &RenderInheritanceData) {
        self.scene_sets = inheritance.scene_sets.clone();
        self.extent = inheritance.extent;
        self.batcher.mark_all_dirty();
    }
}

impl FrameStage for TerrainRenderer {
    fn begin_stage(&mut self, image: usize, target: InheritanceTarget) -> VulkanResult<()> {
        self.batcher.begin(image);
        self.recorded[image].clear();
        self.graphics.begin_graphics(image, target, self.extent)?;
        self.compute.begin_compute(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cull_workgroups_round_up() {
        assert_eq!(cull_workgroups(1), 1);
        assert_eq!(cull_workgroups(64), 1);
        assert_eq!(cull_workgroups(65), 2);
        assert_eq!(cull_workgroups(25), 1);
        assert_eq!(cull_workgroups(0), 0);
    }
}
