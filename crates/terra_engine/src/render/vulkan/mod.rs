//! Vulkan backend
//!
//! Thin RAII wrappers over `ash`. Every wrapper owns the handles it creates
//! and destroys them on drop; callers keep the [`VulkanContext`] alive longer
//! than anything created from it.

pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptor;
pub mod framebuffer;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod window;

pub use buffer::Buffer;
pub use commands::{ActiveRenderPass, CommandPool, InheritanceTarget};
pub use context::{QueueFamilies, VulkanContext, VulkanError, VulkanInstance, VulkanResult};
pub use descriptor::{DescriptorLayout, DescriptorPool, DescriptorSet};
pub use framebuffer::{DepthBuffer, Framebuffer};
pub use image::{Image, ImageDesc, Sampler, Texture};
pub use memory::Memory;
pub use pipeline::{ComputePipeline, GraphicsPipeline, PipelineConfig, PipelineOverrides};
pub use render_pass::RenderPass;
pub use shader::ShaderModule;
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync, Semaphore};
pub use window::{Window, WindowError};
