//! Graphics and compute pipelines
//!
//! [`PipelineConfig`] starts from engine-wide fixed-function defaults. Each
//! `with_*` call replaces one stage and records it in the [`PipelineOverrides`]
//! mask; stages not in the mask always use the defaults. Viewport and scissor
//! are dynamic so pipelines survive swapchain resizes.

use ash::{vk, Device};
use bitflags::bitflags;
use std::path::{Path, PathBuf};

use super::context::{VulkanError, VulkanResult};
use super::shader::ShaderModule;

bitflags! {
    /// Fixed-function stages a config replaces
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipelineOverrides: u32 {
        /// Vertex bindings and attributes
        const VERTEX_INPUT = 1 << 0;
        /// Primitive topology
        const INPUT_ASSEMBLY = 1 << 1;
        /// Polygon mode, culling and winding
        const RASTERIZATION = 1 << 2;
        /// Depth test and write
        const DEPTH_STENCIL = 1 << 3;
    }
}

/// Vertex bindings and attributes
#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    /// Buffer bindings
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    /// Shader input locations
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Rasterizer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rasterization {
    /// Fill, line or point
    pub polygon_mode: vk::PolygonMode,
    /// Faces discarded
    pub cull_mode: vk::CullModeFlags,
    /// Winding treated as front-facing
    pub front_face: vk::FrontFace,
}

impl Default for Rasterization {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

/// Depth test state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencil {
    /// Compare against the depth buffer
    pub test: bool,
    /// Write passing fragments' depth
    pub write: bool,
    /// Comparison operator
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencil {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

/// Shaders plus fixed-function overrides for one graphics pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    overrides: PipelineOverrides,
    vertex_input: VertexInput,
    topology: vk::PrimitiveTopology,
    rasterization: Rasterization,
    depth_stencil: DepthStencil,
}

impl PipelineConfig {
    /// Config with every stage at its default
    pub fn new(vertex_shader: impl AsRef<Path>, fragment_shader: impl AsRef<Path>) -> Self {
        Self {
            vertex_shader: vertex_shader.as_ref().to_path_buf(),
            fragment_shader: fragment_shader.as_ref().to_path_buf(),
            overrides: PipelineOverrides::empty(),
            vertex_input: VertexInput::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            rasterization: Rasterization::default(),
            depth_stencil: DepthStencil::default(),
        }
    }

    /// Replace the vertex input state
    pub fn with_vertex_input(mut self, vertex_input: VertexInput) -> Self {
        self.vertex_input = vertex_input;
        self.overrides |= PipelineOverrides::VERTEX_INPUT;
        self
    }

    /// Replace the primitive topology
    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self.overrides |= PipelineOverrides::INPUT_ASSEMBLY;
        self
    }

    /// Replace the rasterizer state
    pub fn with_rasterization(mut self, rasterization: Rasterization) -> Self {
        self.rasterization = rasterization;
        self.overrides |= PipelineOverrides::RASTERIZATION;
        self
    }

    /// Replace the depth state
    pub fn with_depth_stencil(mut self, depth_stencil: DepthStencil) -> Self {
        self.depth_stencil = depth_stencil;
        self.overrides |= PipelineOverrides::DEPTH_STENCIL;
        self
    }

    /// Stages replaced so far
    pub fn overrides(&self) -> PipelineOverrides {
        self.overrides
    }

    /// Vertex input in effect
    pub fn effective_vertex_input(&self) -> VertexInput {
        if self.overrides.contains(PipelineOverrides::VERTEX_INPUT) {
            self.vertex_input.clone()
        } else {
            VertexInput::default()
        }
    }

    /// Topology in effect
    pub fn effective_topology(&self) -> vk::PrimitiveTopology {
        if self.overrides.contains(PipelineOverrides::INPUT_ASSEMBLY) {
            self.topology
        } else {
            vk::PrimitiveTopology::TRIANGLE_LIST
        }
    }

    /// Rasterizer state in effect
    pub fn effective_rasterization(&self) -> Rasterization {
        if self.overrides.contains(PipelineOverrides::RASTERIZATION) {
            self.rasterization
        } else {
            Rasterization::default()
        }
    }

    /// Depth state in effect
    pub fn effective_depth_stencil(&self) -> DepthStencil {
        if self.overrides.contains(PipelineOverrides::DEPTH_STENCIL) {
            self.depth_stencil
        } else {
            DepthStencil::default()
        }
    }
}

/// Graphics pipeline and its layout
pub struct GraphicsPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Build a pipeline for subpass 0 of `render_pass`
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        config: &PipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        let vertex_shader = ShaderModule::from_file(device, &config.vertex_shader)?;
        let fragment_shader = ShaderModule::from_file(device, &config.fragment_shader)?;
        let shader_stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let vertex = config.effective_vertex_input();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex.bindings)
            .vertex_attribute_descriptions(&vertex.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(config.effective_topology())
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let raster = config.effective_rasterization();
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(raster.polygon_mode)
            .line_width(1.0)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth = config.effective_depth_stencil();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(depth.test)
            .depth_write_enable(depth.write)
            .depth_compare_op(depth.compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Every pass draws opaque geometry
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let layout = create_layout(device, set_layouts, push_constant_ranges)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(VulkanError::Api(err));
            }
        };

        Ok(Self {
            device: device.clone(),
            pipeline,
            layout,
        })
    }

    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Compute pipeline and its layout
pub struct ComputePipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Build a pipeline from one compute shader file
    pub fn new(
        device: &Device,
        shader: impl AsRef<Path>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        let module = ShaderModule::from_file(device, shader)?;
        let layout = create_layout(device, set_layouts, push_constant_ranges)?;

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(module.stage_info(vk::ShaderStageFlags::COMPUTE))
            .layout(layout)
            .build();

        let pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(VulkanError::Api(err));
            }
        };

        Ok(Self {
            device: device.clone(),
            pipeline,
            layout,
        })
    }

    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> VulkanResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    unsafe { device.create_pipeline_layout(&layout_info, None).map_err(VulkanError::Api) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_overrides() {
        let config = PipelineConfig::new("a.vert.spv", "a.frag.spv");
        assert!(config.overrides().is_empty());
        assert_eq!(config.effective_rasterization(), Rasterization::default());
        assert_eq!(config.effective_depth_stencil(), DepthStencil::default());
        assert!(config.effective_vertex_input().bindings.is_empty());
    }

    #[test]
    fn test_every_override_flag_has_a_setter() {
        let config = PipelineConfig::new("a.vert.spv", "a.frag.spv")
            .with_vertex_input(VertexInput::default())
            .with_topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
            .with_rasterization(Rasterization::default())
            .with_depth_stencil(DepthStencil::default());
        assert_eq!(config.overrides(), PipelineOverrides::all());
    }

    #[test]
    fn test_only_flagged_stages_replace_defaults() {
        let sky_depth = DepthStencil {
            test: true,
            write: false,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        };
        let config = PipelineConfig::new("a", "b")
            .with_depth_stencil(sky_depth)
            .with_topology(vk::PrimitiveTopology::LINE_LIST);

        assert_eq!(
            config.overrides(),
            PipelineOverrides::DEPTH_STENCIL | PipelineOverrides::INPUT_ASSEMBLY
        );
        assert_eq!(config.effective_depth_stencil(), sky_depth);
        assert_eq!(config.effective_topology(), vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(config.effective_rasterization(), Rasterization::default());
    }
}
