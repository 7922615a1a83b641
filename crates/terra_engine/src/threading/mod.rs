//! Worker threads used for command recording and asset loading

mod thread_manager;

pub use thread_manager::{Job, ThreadManager};

/// Records model secondary command buffers
pub const MODEL_THREAD: usize = 0;

/// Records cube map secondary command buffers
pub const CUBEMAP_THREAD: usize = 1;

/// Records terrain graphics and compute secondary command buffers
pub const TERRAIN_THREAD: usize = 2;

/// Parses model files off the main thread
pub const LOADER_THREAD: usize = 3;

/// Number of workers the renderer expects
pub const ENGINE_THREAD_COUNT: usize = 4;
