//! Instanced model drawing

use std::sync::Arc;

use ash::{vk, Device};

use crate::assets::{Model, ModelDrawData};
use crate::config::RendererConfig;
use crate::foundation::collections::{key_id, ModelKey, SlotMap};
use crate::foundation::math::Mat4;
use crate::render::frame::FrameStage;
use crate::render::instancing::InstanceBatcher;
use crate::render::layouts::SetLayouts;
use crate::render::recorder::SecondaryRecorder;
use crate::render::scene_data::RenderInheritanceData;
use crate::render::vertex::Vertex;
use crate::render::vulkan::pipeline::VertexInput;
use crate::render::vulkan::{GraphicsPipeline, InheritanceTarget, PipelineConfig, VulkanContext, VulkanResult};
use crate::threading::{ThreadManager, MODEL_THREAD};

const SCENE_SET: u32 = 0;
const NODE_SET: u32 = 1;
const MATERIAL_SET: u32 = 2;
const INSTANCE_SET: u32 = 3;

/// Records every model draw of a frame into one secondary buffer
pub struct ModelRenderer {
    ctx: Arc<VulkanContext>,
    batcher: InstanceBatcher<ModelKey>,
    pipeline: GraphicsPipeline,
    recorder: SecondaryRecorder,
    scene_sets: Vec<vk::DescriptorSet>,
    extent: vk::Extent2D,
}

impl ModelRenderer {
    /// Build the model pipeline against the main render pass
    pub fn new(
        ctx: Arc<VulkanContext>,
        threads: Arc<ThreadManager>,
        config: &RendererConfig,
        layouts: &SetLayouts,
        inheritance: &RenderInheritanceData,
    ) -> VulkanResult<Self> {
        let batcher = InstanceBatcher::new(ctx.device(), "models", inheritance.image_count)?;
        let pipeline_config = PipelineConfig::new(
            config.shader_path(&config.model_vertex),
            config.shader_path(&config.model_fragment),
        )
        .with_vertex_input(VertexInput {
            bindings: Vertex::binding_descriptions(),
            attributes: Vertex::attribute_descriptions(),
        });
        let set_layouts = [
            inheritance.scene_layout,
            layouts.node.handle(),
            layouts.material.handle(),
            batcher.instance_layout(),
        ];
        let pipeline = GraphicsPipeline::new(ctx.device(), inheritance.render_pass, &pipeline_config, &set_layouts, &[])?;
        let recorder = SecondaryRecorder::new(
            &ctx,
            threads,
            MODEL_THREAD,
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

    /// Queue one instance of `model`
    pub fn draw_model(&mut self, image: usize, key: ModelKey, model: &Model, transform: &Mat4) -> VulkanResult<()> {
        self.draw_model_instanced(image, key, model, std::slice::from_ref(transform))
    }

    /// Queue `model` with one instance per transform.
    ///
    /// Models still loading are skipped, as are empty transform lists.
    pub fn draw_model_instanced(
        &mut self,
        image: usize,
        key: ModelKey,
        model: &Model,
        transforms: &[Mat4],
    ) -> VulkanResult<()> {
        if !model.has_loaded() || transforms.is_empty() {
            return Ok(());
        }
        self.batcher.draw(&self.ctx, image, key_id(key), key, transforms)?;
        Ok(())
    }

    /// Record every batch drawn this frame and close `image`'s secondary buffer
    pub fn end(&mut self, image: usize, models: &SlotMap<ModelKey, Model>) -> VulkanResult<vk::CommandBuffer> {
        self.batcher.prepare(image)?;

        let pipeline = self.pipeline.handle();
        let layout = self.pipeline.layout();
        let scene_set = self.scene_sets[image];
        for draw in self.batcher.live(image) {
            let Some(data) = models.get(draw.handle).and_then(Model::draw_data) else {
                continue;
            };
            self.recorder.record(image, draw.id, move |device, command_buffer| {
                record_model(
                    device,
                    command_buffer,
                    pipeline,
                    layout,
                    [scene_set, draw.instance_set],
                    draw.instance_count,
                    &data,
                );
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

impl FrameStage for ModelRenderer {
    fn begin_stage(&mut self, image: usize, target: InheritanceTarget) -> VulkanResult<()> {
        self.batcher.begin(image);
        self.recorder.begin_graphics(image, target, self.extent)
    }
}

fn record_model(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    [scene_set, instance_set]: [vk::DescriptorSet; 2],
    instance_count: u32,
    data: &ModelDrawData,
) {
    unsafe {
        device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            SCENE_SET,
            &[scene_set],
            &[],
        );
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            INSTANCE_SET,
            &[instance_set],
            &[],
        );
        device.cmd_bind_vertex_buffers(command_buffer, 0, &[data.vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(command_buffer, data.index_buffer, 0, vk::IndexType::UINT32);
    }
    for &root in &data.roots {
        record_node(device, command_buffer, layout, data, root, instance_count);
    }
}

fn record_node(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    layout: vk::PipelineLayout,
    data: &ModelDrawData,
    index: usize,
    instance_count: u32,
) {
    let node = &data.nodes[index];
    unsafe {
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            NODE_SET,
            &[node.node_set],
            &[],
        );
        for primitive in &node.primitives {
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                MATERIAL_SET,
                &[primitive.material_set],
                &[],
            );
            device.cmd_draw_indexed(
                command_buffer,
                primitive.index_count,
                instance_count,
                primitive.first_index,
                primitive.vertex_offset,
                0,
            );
        }
    }
    for &child in &node.children {
        record_node(device, command_buffer, layout, data, child, instance_count);
    }
}
