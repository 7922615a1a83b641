//! # Rendering System
//!
//! Frame orchestration over the Vulkan backend.
//!
//! ## Architecture
//!
//! - **Renderer**: acquires, records, submits and presents; owns everything sized by the swapchain
//! - **Per-type renderers**: models, cube maps and terrain, each recording a secondary
//!   command buffer per image on its own worker thread
//! - **Batching**: draws grouped by (resource, instance count) so one instanced draw serves many objects
//! - **Vulkan Backend**: RAII wrappers in [`vulkan`]

pub mod batch;
pub mod camera;
pub mod frame;
pub mod instancing;
pub mod layouts;
pub mod ownership;
pub mod recorder;
pub mod scene_data;
pub mod vertex;
pub mod vulkan;

pub mod cubemap_renderer;
pub mod model_renderer;
pub mod renderer;
pub mod terrain_renderer;

pub use camera::Camera;
pub use cubemap_renderer::CubeMapRenderer;
pub use model_renderer::ModelRenderer;
pub use renderer::Renderer;
pub use scene_data::RenderInheritanceData;
pub use terrain_renderer::TerrainRenderer;
pub use vertex::Vertex;
