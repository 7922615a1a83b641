//! Frame orchestration
//!
//! [`Renderer`] owns the swapchain and everything sized by it, the per-frame
//! synchronization objects and the three per-type renderers. A frame is
//! `begin` -> any number of `draw_*` -> `end`; both ends return `Ok(false)`
//! when the swapchain went stale and [`Renderer::recreate_swapchain`] is due.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;

use crate::assets::{AssetLoader, CubeMap, ImageData, Model, ProceduralSource, SceneAssets};
use crate::config::EngineConfig;
use crate::foundation::collections::{CubeMapKey, ModelKey, TerrainKey};
use crate::foundation::math::{Mat4, Vec3};
use crate::render::camera::Camera;
use crate::render::cubemap_renderer::CubeMapRenderer;
use crate::render::frame::{classify_present, start_frame, FrameCycle, FrameStage};
use crate::render::layouts::SetLayouts;
use crate::render::model_renderer::ModelRenderer;
use crate::render::scene_data::{FrustumUniform, RenderInheritanceData, SceneUniform};
use crate::render::terrain_renderer::TerrainRenderer;
use crate::render::vulkan::commands::begin_primary;
use crate::render::vulkan::{
    ActiveRenderPass, Buffer, CommandPool, DepthBuffer, DescriptorPool, Framebuffer, FrameSync, InheritanceTarget,
    RenderPass, Swapchain, VulkanContext, VulkanError, VulkanResult,
};
use crate::terrain::Terrain;
use crate::threading::{ThreadManager, ENGINE_THREAD_COUNT};

const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.05, 1.0];

/// Camera uniform buffer and set per swapchain image
struct SceneResources {
    sets: Vec<vk::DescriptorSet>,
    buffers: Vec<Buffer>,
    _pool: DescriptorPool,
}

impl SceneResources {
    fn new(ctx: &VulkanContext, layouts: &SetLayouts, image_count: usize) -> VulkanResult<Self> {
        let mut pool = DescriptorPool::new();
        pool.add_descriptor_layout(&layouts.scene, 1);
        pool.init(ctx.device(), image_count as u32)?;

        let mut sets = Vec::with_capacity(image_count);
        let mut buffers = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            let buffer = Buffer::host_visible(
                ctx,
                std::mem::size_of::<SceneUniform>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            let mut set = pool.allocate(&layouts.scene)?;
            set.set_buffer_desc(0, buffer.descriptor_info())?;
            set.update(ctx.device());
            sets.push(set.handle());
            buffers.push(buffer);
        }
        Ok(Self {
            sets,
            buffers,
            _pool: pool,
        })
    }
}

fn create_framebuffers(
    ctx: &VulkanContext,
    swapchain: &Swapchain,
    render_pass: &RenderPass,
    depth: &DepthBuffer,
) -> VulkanResult<Vec<Framebuffer>> {
    swapchain
        .image_views()
        .iter()
        .map(|&view| Framebuffer::new(ctx.device(), render_pass.handle(), &[view, depth.view()], swapchain.extent()))
        .collect()
}

fn create_sync(ctx: &VulkanContext, count: usize) -> VulkanResult<Vec<FrameSync>> {
    (0..count).map(|_| FrameSync::new(ctx.device())).collect()
}

/// Orchestrates the per-type renderers into presented frames
pub struct Renderer {
    model_renderer: ModelRenderer,
    cubemap_renderer: CubeMapRenderer,
    terrain_renderer: TerrainRenderer,
    loader: AssetLoader,
    sync: Vec<FrameSync>,
    graphics_buffers: Vec<vk::CommandBuffer>,
    compute_buffers: Vec<vk::CommandBuffer>,
    graphics_pool: CommandPool,
    compute_pool: CommandPool,
    upload_pool: CommandPool,
    framebuffers: Vec<Framebuffer>,
    depth: DepthBuffer,
    scene: SceneResources,
    render_pass: RenderPass,
    swapchain: Swapchain,
    layouts: SetLayouts,
    cycle: FrameCycle,
    camera: Camera,
    config: EngineConfig,
    threads: Arc<ThreadManager>,
    ctx: Arc<VulkanContext>,
}

impl Renderer {
    /// Create the swapchain and everything that depends on it.
    ///
    /// `threads` must have at least [`ENGINE_THREAD_COUNT`] workers.
    pub fn new(
        ctx: Arc<VulkanContext>,
        window_extent: vk::Extent2D,
        config: &EngineConfig,
        threads: Arc<ThreadManager>,
    ) -> VulkanResult<Self> {
        if threads.thread_count() < ENGINE_THREAD_COUNT {
            return Err(VulkanError::InitializationFailed(format!(
                "renderer needs {ENGINE_THREAD_COUNT} worker threads, got {}",
                threads.thread_count()
            )));
        }

        let swapchain = Swapchain::new(&ctx, window_extent, None, vk::SwapchainKHR::null())?;
        let image_count = swapchain.image_count();
        let extent = swapchain.extent();
        let families = ctx.families();

        let upload_pool = CommandPool::new(ctx.device(), families.graphics)?;
        let depth = DepthBuffer::new(&ctx, &upload_pool, extent)?;
        let render_pass = RenderPass::new_main(ctx.device(), swapchain.format(), depth.format())?;
        let framebuffers = create_framebuffers(&ctx, &swapchain, &render_pass, &depth)?;

        let layouts = SetLayouts::new(ctx.device())?;
        let scene = SceneResources::new(&ctx, &layouts, image_count)?;

        let cycle = FrameCycle::new(image_count);
        let sync = create_sync(&ctx, cycle.frames_in_flight())?;

        let graphics_pool = CommandPool::new(ctx.device(), families.graphics)?;
        let graphics_buffers = graphics_pool.create_command_buffers(image_count as u32, vk::CommandBufferLevel::PRIMARY)?;
        let compute_pool = CommandPool::new(ctx.device(), families.compute)?;
        let compute_buffers = compute_pool.create_command_buffers(image_count as u32, vk::CommandBufferLevel::PRIMARY)?;

        let mut camera = Camera::default();
        camera.set_aspect_ratio(extent.width, extent.height);

        let inheritance = RenderInheritanceData {
            render_pass: render_pass.handle(),
            scene_layout: layouts.scene.handle(),
            scene_sets: scene.sets.clone(),
            extent,
            image_count,
        };
        let renderer_config = &config.renderer;
        let model_renderer =
            ModelRenderer::new(Arc::clone(&ctx), Arc::clone(&threads), renderer_config, &layouts, &inheritance)?;
        let cubemap_renderer =
            CubeMapRenderer::new(Arc::clone(&ctx), Arc::clone(&threads), renderer_config, &layouts, &inheritance)?;
        let terrain_renderer =
            TerrainRenderer::new(Arc::clone(&ctx), Arc::clone(&threads), renderer_config, &layouts, &inheritance)?;

        let loader = AssetLoader::new(Arc::clone(&threads), Arc::new(ProceduralSource));

        log::info!(
            "Renderer ready: {image_count} swapchain images, {} frames in flight, {}x{}",
            cycle.frames_in_flight(),
            extent.width,
            extent.height
        );

        Ok(Self {
            model_renderer,
            cubemap_renderer,
            terrain_renderer,
            loader,
            sync,
            graphics_buffers,
            compute_buffers,
            graphics_pool,
            compute_pool,
            upload_pool,
            framebuffers,
            depth,
            scene,
            render_pass,
            swapchain,
            layouts,
            cycle,
            camera,
            config: config.clone(),
            threads,
            ctx,
        })
    }

    /// Device context shared with the application
    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.ctx
    }

    /// Camera used for the scene uniform and terrain culling
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Mutable camera
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Replace the camera; the aspect ratio is kept in sync with the swapchain
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        let extent = self.swapchain.extent();
        self.camera.set_aspect_ratio(extent.width, extent.height);
    }

    /// Swapchain image count; may change on [`Self::recreate_swapchain`]
    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    /// What every per-type renderer inherits from the orchestrator
    pub fn scene_inheritance(&self) -> RenderInheritanceData {
        RenderInheritanceData {
            render_pass: self.render_pass.handle(),
            scene_layout: self.layouts.scene.handle(),
            scene_sets: self.scene.sets.clone(),
            extent: self.swapchain.extent(),
            image_count: self.swapchain.image_count(),
        }
    }

    /// Block until the GPU is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.ctx.wait_idle()
    }

    /// Register a model and start parsing `path` in the background
    pub fn load_model(&self, assets: &mut SceneAssets, path: impl Into<PathBuf>) -> ModelKey {
        let path = path.into();
        let key = assets.models.insert(Model::new(path.display().to_string()));
        self.loader.load_on_thread(path, key);
        key
    }

    /// Upload a cube map from six decoded faces
    pub fn create_cube_map(&self, assets: &mut SceneAssets, faces: &[ImageData; 6]) -> VulkanResult<CubeMapKey> {
        let cube_map = CubeMap::new(&self.ctx, &self.upload_pool, &self.layouts, faces)?;
        Ok(assets.cube_maps.insert(cube_map))
    }

    /// Create a terrain centred on the region containing `position`
    pub fn create_terrain(&self, assets: &mut SceneAssets, position: Vec3) -> VulkanResult<TerrainKey> {
        let terrain = Terrain::new(
            &self.ctx,
            &self.upload_pool,
            &self.layouts,
            &self.config.terrain,
            self.swapchain.image_count(),
            position,
        )?;
        Ok(assets.terrains.insert(terrain))
    }

    /// Start a frame.
    ///
    /// Uploads finished asset loads, acquires an image and begins every
    /// renderer. `Ok(false)` means the swapchain is stale and nothing was begun.
    pub fn begin(&mut self, assets: &mut SceneAssets) -> VulkanResult<bool> {
        let frame = self.cycle.current_frame();
        self.sync[frame].in_flight.wait(u64::MAX)?;

        let uploaded = self.loader.update(
            &self.ctx,
            &self.upload_pool,
            &self.layouts,
            &mut assets.models,
        )?;
        if uploaded > 0 {
            log::debug!("Uploaded {uploaded} models");
        }

        let acquire = self
            .swapchain
            .acquire_next_image(self.sync[frame].image_available.handle());
        let render_pass = self.render_pass.handle();
        let framebuffers = &self.framebuffers;
        let sync = &self.sync;
        start_frame(
            &mut self.cycle,
            acquire,
            |slot| sync[slot].in_flight.wait(u64::MAX),
            |image| InheritanceTarget {
                render_pass,
                framebuffer: framebuffers[image].handle(),
                subpass: 0,
            },
            &mut [
                &mut self.model_renderer as &mut dyn FrameStage,
                &mut self.cubemap_renderer,
                &mut self.terrain_renderer,
            ],
        )
    }

    fn acquired_image(&self) -> VulkanResult<usize> {
        self.cycle
            .acquired()
            .map(|image| image as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "draw issued outside begin/end".to_string(),
            })
    }

    /// Draw one instance of a model; models still loading are skipped
    pub fn draw_model(&mut self, assets: &SceneAssets, key: ModelKey, transform: &Mat4) -> VulkanResult<()> {
        self.draw_model_instanced(assets, key, std::slice::from_ref(transform))
    }

    /// Draw a model once per transform
    pub fn draw_model_instanced(&mut self, assets: &SceneAssets, key: ModelKey, transforms: &[Mat4]) -> VulkanResult<()> {
        let image = self.acquired_image()?;
        match assets.models.get(key) {
            Some(model) => self.model_renderer.draw_model_instanced(image, key, model, transforms),
            None => Ok(()),
        }
    }

    /// Draw a cube map
    pub fn draw_cube_map(&mut self, assets: &SceneAssets, key: CubeMapKey, transform: &Mat4) -> VulkanResult<()> {
        let image = self.acquired_image()?;
        match assets.cube_maps.get(key) {
            Some(cube_map) => self.cubemap_renderer.draw_cube_map(image, key, cube_map, transform),
            None => Ok(()),
        }
    }

    /// Draw a terrain with frustum culling
    pub fn draw_terrain(&mut self, assets: &SceneAssets, key: TerrainKey, transform: &Mat4) -> VulkanResult<()> {
        let image = self.acquired_image()?;
        match assets.terrains.get(key) {
            Some(terrain) => self.terrain_renderer.draw_terrain(image, key, terrain, transform),
            None => Ok(()),
        }
    }

    /// Record, submit and present the frame.
    ///
    /// `Ok(false)` means presentation found the swapchain stale; the frame was
    /// still submitted.
    pub fn end(&mut self, assets: &mut SceneAssets) -> VulkanResult<bool> {
        let image = self.acquired_image()?;
        let frame = self.cycle.current_frame();

        self.scene.buffers[image].write(0, bytemuck::bytes_of(&SceneUniform::from_camera(&self.camera)))?;

        let models = self.model_renderer.end(image, &assets.models)?;
        let cube_maps = self.cubemap_renderer.end(image, &assets.cube_maps)?;
        let frustum = FrustumUniform::from_camera(&self.camera);
        let terrain = self.terrain_renderer.end(image, &assets.terrains, &frustum)?;

        let compute_submitted = match terrain.compute {
            Some(secondary) => {
                self.submit_compute(image, frame, secondary, assets)?;
                true
            }
            None => false,
        };

        let device = self.ctx.device();
        let command_buffer = self.graphics_buffers[image];
        begin_primary(device, command_buffer)?;
        let acquired = self
            .terrain_renderer
            .pre_record_graphics(image, command_buffer, &mut assets.terrains)?;
        {
            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue { float32: CLEAR_COLOR },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                },
            ];
            let pass = ActiveRenderPass::begin(
                device,
                command_buffer,
                self.render_pass.handle(),
                self.framebuffers[image].handle(),
                self.swapchain.extent(),
                &clear_values,
            );
            // Skybox last: it only fills pixels nothing else covered
            pass.execute(&[models, terrain.graphics, cube_maps]);
        }
        self.terrain_renderer
            .post_record_graphics(image, command_buffer, &mut assets.terrains, acquired)?;
        unsafe { device.end_command_buffer(command_buffer).map_err(VulkanError::Api)? };

        let sync = &self.sync[frame];
        let mut wait_semaphores = vec![sync.image_available.handle()];
        let mut wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        if compute_submitted {
            wait_semaphores.push(sync.compute_finished.handle());
            wait_stages.push(vk::PipelineStageFlags::DRAW_INDIRECT);
        }
        let command_buffers = [command_buffer];
        let signal_semaphores = [sync.render_finished.handle()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        sync.in_flight.reset()?;
        unsafe {
            device
                .queue_submit(self.ctx.graphics_queue(), &[submit_info], sync.in_flight.handle())
                .map_err(VulkanError::Api)?;
        }

        let present = self
            .swapchain
            .present(self.ctx.present_queue(), sync.render_finished.handle(), image as u32);
        self.cycle.advance();
        let fresh = classify_present(present)?;
        if !fresh {
            log::debug!("Swapchain stale on present");
        }
        Ok(fresh)
    }

    fn submit_compute(
        &self,
        image: usize,
        frame: usize,
        secondary: vk::CommandBuffer,
        assets: &mut SceneAssets,
    ) -> VulkanResult<()> {
        let device = self.ctx.device();
        let command_buffer = self.compute_buffers[image];
        begin_primary(device, command_buffer)?;
        let acquired = self
            .terrain_renderer
            .pre_record_compute(image, command_buffer, &mut assets.terrains)?;
        unsafe { device.cmd_execute_commands(command_buffer, &[secondary]) };
        self.terrain_renderer
            .post_record_compute(image, command_buffer, &mut assets.terrains, acquired)?;
        unsafe { device.end_command_buffer(command_buffer).map_err(VulkanError::Api)? };

        let command_buffers = [command_buffer];
        let signal_semaphores = [self.sync[frame].compute_finished.handle()];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            device
                .queue_submit(self.ctx.compute_queue(), &[submit_info], vk::Fence::null())
                .map_err(VulkanError::Api)
        }
    }

    /// Rebuild the swapchain and everything sized by it for `window_extent`.
    ///
    /// The old image count is requested. When the driver returns another
    /// count, everything kept per image is rebuilt: scene uniforms, sync
    /// objects, primaries, the per-type renderers and each terrain's frames.
    /// Otherwise the renderers only mark every batch for rebuild.
    pub fn recreate_swapchain(&mut self, assets: &mut SceneAssets, window_extent: vk::Extent2D) -> VulkanResult<()> {
        self.ctx.wait_idle()?;

        let old_count = self.swapchain.image_count();
        let swapchain = Swapchain::new(&self.ctx, window_extent, Some(old_count as u32), self.swapchain.handle())?;
        self.framebuffers.clear();
        self.swapchain = swapchain;
        let image_count = self.swapchain.image_count();

        let extent = self.swapchain.extent();
        self.depth = DepthBuffer::new(&self.ctx, &self.upload_pool, extent)?;
        self.framebuffers = create_framebuffers(&self.ctx, &self.swapchain, &self.render_pass, &self.depth)?;
        self.camera.set_aspect_ratio(extent.width, extent.height);
        self.cycle.reset(image_count);
        self.sync = create_sync(&self.ctx, self.cycle.frames_in_flight())?;
        self.graphics_pool.reset()?;
        self.compute_pool.reset()?;

        if image_count == old_count {
            let inheritance = self.scene_inheritance();
            self.model_renderer.update_inheritance(&inheritance);
            self.cubemap_renderer.update_inheritance(&inheritance);
            self.terrain_renderer.update_inheritance(&inheritance);
        } else {
            log::info!("Swapchain image count changed from {old_count} to {image_count}");
            self.resize_images(assets, image_count)?;
        }

        log::info!("Recreated swapchain at {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn resize_images(&mut self, assets: &mut SceneAssets, image_count: usize) -> VulkanResult<()> {
        self.scene = SceneResources::new(&self.ctx, &self.layouts, image_count)?;

        self.graphics_pool.free(&self.graphics_buffers);
        self.graphics_buffers = self
            .graphics_pool
            .create_command_buffers(image_count as u32, vk::CommandBufferLevel::PRIMARY)?;
        self.compute_pool.free(&self.compute_buffers);
        self.compute_buffers = self
            .compute_pool
            .create_command_buffers(image_count as u32, vk::CommandBufferLevel::PRIMARY)?;

        let inheritance = self.scene_inheritance();
        let renderer_config = &self.config.renderer;
        self.model_renderer = ModelRenderer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.threads),
            renderer_config,
            &self.layouts,
            &inheritance,
        )?;
        self.cubemap_renderer = CubeMapRenderer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.threads),
            renderer_config,
            &self.layouts,
            &inheritance,
        )?;
        self.terrain_renderer = TerrainRenderer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.threads),
            renderer_config,
            &self.layouts,
            &inheritance,
        )?;

        for terrain in assets.terrains.values_mut() {
            terrain.resize_frames(&self.ctx, &self.upload_pool, &self.layouts, image_count)?;
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.wait_idle() {
            log::error!("Failed to idle device before renderer teardown: {err}");
        }
    }
}
