//! Skybox drawing

use std::sync::Arc;

use ash::vk;

use crate::assets::{CubeMap, CubeMapDrawData};
use crate::config::RendererConfig;
use crate::foundation::collections::{key_id, CubeMapKey, SlotMap};
use crate::foundation::math::Mat4;
use crate::render::frame::FrameStage;
use crate::render::instancing::InstanceBatcher;
use crate::render::layouts::SetLayouts;
use crate::render::recorder::SecondaryRecorder;
use crate::render::scene_data::RenderInheritanceData;
use crate::render::vertex::Vertex;
use crate::render::vulkan::pipeline::{DepthStencil, Rasterization, VertexInput};
use crate::render::vulkan::{GraphicsPipeline, InheritanceTarget, PipelineConfig, VulkanContext, VulkanResult};
use crate::threading::{ThreadManager, CUBEMAP_THREAD};

/// Records cube map draws into one secondary buffer per image
pub struct CubeMapRenderer {
    ctx: Arc<VulkanContext>,
    batcher: InstanceBatcher<CubeMapKey>,
    pipeline: GraphicsPipeline,
    recorder: SecondaryRecorder,
    scene_sets: Vec<vk::DescriptorSet>,
    extent: vk::Extent2D,
}

impl CubeMapRenderer {
    /// Build the skybox pipeline: both faces drawn, depth tested at the far plane but never written
    pub fn new(
        ctx: Arc<VulkanContext>,
        threads: Arc<ThreadManager>,
        config: &RendererConfig,
        layouts: &SetLayouts,
        inheritance: &RenderInheritanceData,
    ) -> VulkanResult<Self> {
        let batcher = InstanceBatcher::new(ctx.device(), "cube maps", inheritance.image_count)?;
        let pipeline_config = PipelineConfig::new(
            config.shader_path(&config.cube_map_vertex),
            config.shader_path(&config.cube_map_fragment),
        )
        .with_vertex_input(VertexInput {
            bindings: Vertex::binding_descriptions(),
            attributes: Vertex::attribute_descriptions(),
        })
        .with_rasterization(Rasterization {
            cull_mode: vk::CullModeFlags::NONE,
            ..Rasterization::default()
        })
        .with_depth_stencil(DepthStencil {
            test: true,
            write: false,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        });
        let set_layouts = [
            inheritance.scene_layout,
            layouts.cube_map.handle(),
            batcher.instance_layout(),
        ];
        let pipeline = GraphicsPipeline::new(ctx.device(), inheritance.render_pass, &pipeline_config, &set_layouts, &[])?;
        let recorder = SecondaryRecorder::new(
            &ctx,
            threads,
            CUBEMAP_THREAD,
            ctx.families().graphics,
            inheritance.image_count,
        )?;

        Ok(Self {
            ctx,
            batcher,
            pipeline,
            recorder,
            scene_sets: inheritance.scene_sets.clone(),
            extent: inheritance.extent,
        })
    }

    /// Queue `cube_map` with the given transform
    pub fn draw_cube_map(
        &mut self,
        image: usize,
        key: CubeMapKey,
        _cube_map: &CubeMap,
        transform: &Mat4,
    ) -> VulkanResult<()> {
        self.batcher
            .draw(&self.ctx, image, key_id(key), key, std::slice::from_ref(transform))?;
        Ok(())
    }

    /// Record this frame's cube maps and close `image`'s secondary buffer
    pub fn end(&mut self, image: usize, cube_maps: &SlotMap<CubeMapKey, CubeMap>) -> VulkanResult<vk::CommandBuffer> {
        self.batcher.prepare(image)?;

        let pipeline = self.pipeline.handle();
        let layout = self.pipeline.layout();
        let scene_set = self.scene_sets[image];
        for draw in self.batcher.live(image) {
            let Some(data) = cube_maps.get(draw.handle).map(CubeMap::draw_data) else {
                continue;
            };
            self.recorder.record(image, draw.id, move |device, command_buffer| unsafe {
                let CubeMapDrawData {
                    vertex_buffer,
                    index_buffer,
                    index_count,
                    texture_set,
                } = data;
                device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &[scene_set, texture_set, draw.instance_set],
                    &[],
                );
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(command_buffer, index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(command_buffer, index_count, draw.instance_count, 0, 0, 0);
            })?;
        }
        self.recorder.finish(image)
    }

    /// Adopt new scene sets and extent; every batch is rebuilt on its image's next frame
    pub fn update_inheritance(&mut self, inheritance: &RenderInheritanceData) {
        self.scene_sets = inheritance.scene_sets.clone();
        self.extent = inheritance.extent;
        self.batcher.mark_all_dirty();
    }
}

impl FrameStage for CubeMapRenderer {
    fn begin_stage(&mut self, image: usize, target: InheritanceTarget) -> VulkanResult<()> {
        self.batcher.begin(image);
        self.recorder.begin_graphics(image, target, self.extent)
    }
}
