//! # Terra Engine
//!
//! A Vulkan renderer with threaded per-type command recording and
//! compute-culled, streamed terrain.
//!
//! ## Features
//!
//! - **Instanced batching**: draws grouped by (resource, instance count), descriptor pools rebuilt only on insertion
//! - **Threaded recording**: one worker and one secondary command buffer per renderer type
//! - **Terrain streaming**: double-buffered regions following the camera, frustum culled on the compute queue
//! - **Async loading**: models parsed off the main thread, uploaded on it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use terra_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let mut window = Window::new(&config.display.title, 1280, 720)?;
//!     let ctx = Arc::new(VulkanContext::new(&mut window, "demo", false)?);
//!     let threads = Arc::new(ThreadManager::new(ENGINE_THREAD_COUNT)?);
//!     let (w, h) = window.framebuffer_size();
//!     let extent = ash::vk::Extent2D { width: w, height: h };
//!     let mut renderer = Renderer::new(Arc::clone(&ctx), extent, &config, threads)?;
//!     let mut assets = SceneAssets::new();
//!     let cube = renderer.load_model(&mut assets, "cube");
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         if renderer.begin(&mut assets)? {
//!             renderer.draw_model(&assets, cube, &Mat4::identity())?;
//!             renderer.end(&mut assets)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod config;
pub mod foundation;
pub mod render;
pub mod terrain;
pub mod threading;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{AssetSource, CubeMap, ImageData, Model, ModelData, SceneAssets},
        config::{Config, EngineConfig},
        foundation::{
            collections::{CubeMapKey, ModelKey, TerrainKey},
            math::{Mat4, Transform, Vec3},
        },
        render::{
            vulkan::{VulkanContext, VulkanError, VulkanResult, Window},
            Camera, Renderer,
        },
        terrain::Terrain,
        threading::{ThreadManager, ENGINE_THREAD_COUNT},
    };
}
