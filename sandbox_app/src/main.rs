//! Sandbox application
//!
//! Opens a window and renders a skybox, a streamed terrain and a ring of
//! instanced cubes. WASD moves the camera over the terrain; the terrain
//! re-centres when the camera crosses a region boundary.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use glfw::Key;
use terra_engine::assets::cubemap::FACE_NAMES;
use terra_engine::config::{Config, ConfigError};
use terra_engine::foundation::logging;
use terra_engine::foundation::math::{Mat4, Quat, Transform, Vec3};
use terra_engine::prelude::*;
use terra_engine::render::vulkan::WindowError;

const CONFIG_PATH: &str = "sandbox_app/config/engine.toml";
const SKYBOX_DIR: &str = "resources/skybox";
const CUBE_RING: usize = 12;
const MOVE_SPEED: f32 = 20.0;

#[derive(Debug, thiserror::Error)]
enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Vulkan(#[from] VulkanError),
    #[error("failed to spawn worker threads: {0}")]
    Threads(#[from] std::io::Error),
}

struct SandboxApp {
    // Assets hold GPU resources and go before the renderer and context
    assets: SceneAssets,
    renderer: Renderer,
    ctx: Arc<VulkanContext>,
    window: Window,
    cube: ModelKey,
    marker: ModelKey,
    skybox: CubeMapKey,
    terrain: TerrainKey,
    eye: Vec3,
}

fn load_config() -> Result<EngineConfig, ConfigError> {
    if Path::new(CONFIG_PATH).exists() {
        EngineConfig::load(CONFIG_PATH)
    } else {
        log::warn!("{CONFIG_PATH} not found, writing defaults");
        let config = EngineConfig::default();
        if let Some(dir) = Path::new(CONFIG_PATH).parent() {
            std::fs::create_dir_all(dir)?;
        }
        config.save_to_file(CONFIG_PATH)?;
        Ok(config)
    }
}

fn skybox_faces() -> [ImageData; 6] {
    match terra_engine::assets::CubeMap::load_faces(SKYBOX_DIR, "png") {
        Ok(faces) => faces,
        Err(err) => {
            log::warn!("No skybox in {SKYBOX_DIR} ({err}), using flat colours");
            let colors: [[u8; 4]; 6] = [
                [90, 120, 170, 255],
                [90, 120, 170, 255],
                [150, 190, 235, 255],
                [60, 70, 80, 255],
                [100, 135, 185, 255],
                [100, 135, 185, 255],
            ];
            log::debug!("Skybox face order: {FACE_NAMES:?}");
            colors.map(|color| ImageData::solid_color(16, 16, color))
        }
    }
}

impl SandboxApp {
    fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        let display = &config.display;
        let mut window = Window::new(&display.title, display.default_width, display.default_height)?;
        let ctx = Arc::new(VulkanContext::new(&mut window, &display.title, config.debug_layer.active)?);
        let threads = Arc::new(ThreadManager::new(ENGINE_THREAD_COUNT)?);

        let (width, height) = window.framebuffer_size();
        let mut renderer = Renderer::new(Arc::clone(&ctx), vk::Extent2D { width, height }, config, threads)?;

        let eye = Vec3::new(0.0, 25.0, -40.0);
        let mut camera = Camera::perspective(eye, 60.0, width as f32 / height.max(1) as f32, 0.1, 1000.0);
        camera.look_at(Vec3::new(0.0, 0.0, 0.0));
        renderer.set_camera(camera);

        let mut assets = SceneAssets::new();
        let cube = renderer.load_model(&mut assets, "cube");
        let marker = renderer.load_model(&mut assets, "cube:0.9,0.4,0.2");
        let skybox = renderer.create_cube_map(&mut assets, &skybox_faces())?;
        let terrain = renderer.create_terrain(&mut assets, eye)?;

        Ok(Self {
            assets,
            renderer,
            ctx,
            window,
            cube,
            marker,
            skybox,
            terrain,
            eye,
        })
    }

    fn update_camera(&mut self, dt: f32) -> Result<(), SandboxError> {
        let mut direction = Vec3::zeros();
        for (key, step) in [
            (Key::W, Vec3::new(0.0, 0.0, 1.0)),
            (Key::S, Vec3::new(0.0, 0.0, -1.0)),
            (Key::A, Vec3::new(1.0, 0.0, 0.0)),
            (Key::D, Vec3::new(-1.0, 0.0, 0.0)),
        ] {
            if self.window.is_key_down(key) {
                direction += step;
            }
        }
        if direction != Vec3::zeros() {
            self.eye += direction.normalize() * MOVE_SPEED * dt;
        }

        let camera = self.renderer.camera_mut();
        camera.set_position(self.eye);
        camera.look_at(self.eye + Vec3::new(0.0, -25.0, 40.0));

        if let Some(terrain) = self.assets.terrains.get_mut(self.terrain) {
            terrain.follow(&self.ctx, self.eye)?;
        }
        Ok(())
    }

    fn draw(&mut self, time: f32) -> Result<(), SandboxError> {
        let assets = &self.assets;
        let renderer = &mut self.renderer;

        renderer.draw_cube_map(assets, self.skybox, &Mat4::identity())?;
        renderer.draw_terrain(assets, self.terrain, &Mat4::identity())?;

        let ring: Vec<Mat4> = (0..CUBE_RING)
            .map(|i| {
                let angle = time * 0.5 + i as f32 * std::f32::consts::TAU / CUBE_RING as f32;
                Transform::from_position(Vec3::new(angle.cos() * 15.0, 12.0, angle.sin() * 15.0))
                    .with_rotation(Quat::from_axis_angle(&Vec3::y_axis(), time + i as f32))
                    .with_uniform_scale(2.0)
                    .to_matrix()
            })
            .collect();
        renderer.draw_model_instanced(assets, self.cube, &ring)?;

        let bob = Transform::from_position(Vec3::new(0.0, 16.0 + time.sin() * 2.0, 0.0)).with_uniform_scale(3.0);
        renderer.draw_model(assets, self.marker, &bob.to_matrix())?;
        Ok(())
    }

    fn recreate(&mut self) -> Result<(), SandboxError> {
        // Minimised windows report a zero framebuffer; wait until it has area again
        let (mut width, mut height) = self.window.framebuffer_size();
        while (width == 0 || height == 0) && !self.window.should_close() {
            self.window.wait_events();
            (width, height) = self.window.framebuffer_size();
        }
        self.renderer
            .recreate_swapchain(&mut self.assets, vk::Extent2D { width, height })?;
        Ok(())
    }

    fn run(&mut self) -> Result<(), SandboxError> {
        let mut last = Instant::now();
        while !self.window.should_close() {
            self.window.poll_events();
            if self.window.is_key_down(Key::Escape) {
                self.window.set_should_close(true);
            }

            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f32();
            last = now;
            self.update_camera(dt)?;

            let resized = self.window.take_resized();
            if resized || !self.renderer.begin(&mut self.assets)? {
                self.recreate()?;
                continue;
            }

            self.draw(self.window.time() as f32)?;
            if !self.renderer.end(&mut self.assets)? {
                self.recreate()?;
            }
        }
        self.renderer.wait_idle()?;
        Ok(())
    }
}

impl Drop for SandboxApp {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.wait_idle() {
            log::error!("Failed to idle device on shutdown: {err}");
        }
    }
}

fn main() {
    logging::init();

    let result = load_config()
        .map_err(SandboxError::from)
        .and_then(|config| SandboxApp::new(&config))
        .and_then(|mut app| app.run());

    if let Err(err) = result {
        log::error!("Sandbox failed: {err}");
        std::process::exit(1);
    }
    log::info!("Sandbox exited cleanly");
}
