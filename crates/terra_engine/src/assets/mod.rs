//! Assets: models, cube maps and their loaders
//!
//! Assets live in [`SceneAssets`], a set of slot maps. Renderers refer to them
//! by key and never own them.

pub mod cubemap;
pub mod image_data;
pub mod loader;
pub mod model;

pub use cubemap::{CubeMap, CubeMapDrawData};
pub use image_data::ImageData;
pub use loader::{AssetLoader, AssetSource, PendingUpload, ProceduralSource};
pub use model::{MaterialData, Model, ModelData, ModelDrawData, NodeData, PrimitiveData};

use slotmap::SlotMap;
use thiserror::Error;

use crate::foundation::collections::{CubeMapKey, ModelKey, TerrainKey};
use crate::terrain::Terrain;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// File could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Decoded data is inconsistent
    #[error("Invalid data: {0}")]
    Invalid(String),

    /// No source knows the path
    #[error("Asset not found: {0}")]
    NotFound(String),
}

/// Registries for everything drawable
#[derive(Default)]
pub struct SceneAssets {
    /// Models, loaded or loading
    pub models: SlotMap<ModelKey, Model>,
    /// Cube maps
    pub cube_maps: SlotMap<CubeMapKey, CubeMap>,
    /// Terrains
    pub terrains: SlotMap<TerrainKey, Terrain>,
}

impl SceneAssets {
    /// Empty registries
    pub fn new() -> Self {
        Self::default()
    }
}
