use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Config, ConfigDocument, ConfigError};
use crate::terrain::TerrainLayout;

/// Window settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Window title
    pub title: String,
    /// Initial framebuffer width
    pub default_width: u32,
    /// Initial framebuffer height
    pub default_height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title: "Terra Engine".to_string(),
            default_width: 1280,
            default_height: 720,
        }
    }
}

/// Validation layer toggle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugLayerConfig {
    /// Enable `VK_LAYER_KHRONOS_validation` and the debug messenger
    pub active: bool,
}

/// Terrain streaming parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Quads along one side of a region
    pub region_size: u32,
    /// Regions loaded on each side of the camera's region
    pub proximity_radius: u32,
    /// World units between neighbouring vertices
    pub vertex_spacing: f32,
    /// Vertical scale of the height function
    pub height_scale: f32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            region_size: 32,
            proximity_radius: 2,
            vertex_spacing: 1.0,
            height_scale: 8.0,
        }
    }
}

/// Shader locations, one SPIR-V file per pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Directory all shader file names are relative to
    pub shader_dir: String,
    /// Model vertex shader
    pub model_vertex: String,
    /// Model fragment shader
    pub model_fragment: String,
    /// Cube map vertex shader
    pub cube_map_vertex: String,
    /// Cube map fragment shader
    pub cube_map_fragment: String,
    /// Terrain vertex shader
    pub terrain_vertex: String,
    /// Terrain fragment shader
    pub terrain_fragment: String,
    /// Terrain frustum-culling compute shader
    pub terrain_cull: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            shader_dir: "target/shaders".to_string(),
            model_vertex: "model.vert.spv".to_string(),
            model_fragment: "model.frag.spv".to_string(),
            cube_map_vertex: "cubemap.vert.spv".to_string(),
            cube_map_fragment: "cubemap.frag.spv".to_string(),
            terrain_vertex: "terrain.vert.spv".to_string(),
            terrain_fragment: "terrain.frag.spv".to_string(),
            terrain_cull: "terrain_cull.comp.spv".to_string(),
        }
    }
}

impl RendererConfig {
    /// Full path of a shader file name
    pub fn shader_path(&self, file: &str) -> PathBuf {
        Path::new(&self.shader_dir).join(file)
    }
}

/// Everything the engine reads at start-up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window settings
    pub display: DisplayConfig,
    /// Validation layer toggle
    pub debug_layer: DebugLayerConfig,
    /// Terrain streaming parameters
    pub terrain: TerrainConfig,
    /// Shader locations
    pub renderer: RendererConfig,
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Load from `.toml` through key-path lookup, or from `.ron` through serde
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = if path.ends_with(".toml") {
            Self::from_document(&ConfigDocument::load(path)?)?
        } else {
            Self::load_from_file(path)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from key paths, keeping defaults for absent keys
    pub fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let renderer = &defaults.renderer;

        Ok(Self {
            display: DisplayConfig {
                title: doc.string_or("Display/title", &defaults.display.title)?,
                default_width: doc.u32_or("Display/defaultWidth", defaults.display.default_width)?,
                default_height: doc.u32_or("Display/defaultHeight", defaults.display.default_height)?,
            },
            debug_layer: DebugLayerConfig {
                active: doc.bool_or("Debuglayer/active", defaults.debug_layer.active)?,
            },
            terrain: TerrainConfig {
                region_size: doc.u32_or("Terrain/regionSize", defaults.terrain.region_size)?,
                proximity_radius: doc.u32_or("Terrain/proximityRadius", defaults.terrain.proximity_radius)?,
                vertex_spacing: doc.f32_or("Terrain/vertexSpacing", defaults.terrain.vertex_spacing)?,
                height_scale: doc.f32_or("Terrain/heightScale", defaults.terrain.height_scale)?,
            },
            renderer: RendererConfig {
                shader_dir: doc.string_or("Renderer/shaderDir", &renderer.shader_dir)?,
                model_vertex: doc.string_or("Renderer/modelVertex", &renderer.model_vertex)?,
                model_fragment: doc.string_or("Renderer/modelFragment", &renderer.model_fragment)?,
                cube_map_vertex: doc.string_or("Renderer/cubeMapVertex", &renderer.cube_map_vertex)?,
                cube_map_fragment: doc.string_or("Renderer/cubeMapFragment", &renderer.cube_map_fragment)?,
                terrain_vertex: doc.string_or("Renderer/terrainVertex", &renderer.terrain_vertex)?,
                terrain_fragment: doc.string_or("Renderer/terrainFragment", &renderer.terrain_fragment)?,
                terrain_cull: doc.string_or("Renderer/terrainCull", &renderer.terrain_cull)?,
            },
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display.default_width == 0 || self.display.default_height == 0 {
            return Err(ConfigError::Invalid("display size must be non-zero".to_string()));
        }
        if self.terrain.region_size == 0 {
            return Err(ConfigError::Invalid("terrain region_size must be at least 1".to_string()));
        }
        if TerrainLayout::from_config(&self.terrain).is_none() {
            return Err(ConfigError::Invalid(format!(
                "terrain region_size {} with proximity_radius {} is too large",
                self.terrain.region_size, self.terrain.proximity_radius
            )));
        }
        if self.terrain.vertex_spacing <= 0.0 {
            return Err(ConfigError::Invalid("terrain vertex_spacing must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_document_reads_key_paths() {
        let doc = ConfigDocument::parse(
            r#"
[Display]
defaultWidth = 800
defaultHeight = 600

[DebugLayer]
active = true

[terrain]
region_size = 16
proximity_radius = 1
"#,
        )
        .unwrap();

        let config = EngineConfig::from_document(&doc).unwrap();
        assert_eq!(config.display.default_width, 800);
        assert_eq!(config.display.default_height, 600);
        assert!(config.debug_layer.active);
        assert_eq!(config.terrain.region_size, 16);
        assert_eq!(config.terrain.proximity_radius, 1);
        assert_eq!(config.terrain.height_scale, TerrainConfig::default().height_scale);
        assert_eq!(config.renderer, RendererConfig::default());
    }

    #[test]
    fn test_toml_serialization_matches_key_paths() {
        let original = EngineConfig::default();
        let text = toml::to_string_pretty(&original).unwrap();
        let doc = ConfigDocument::parse(&text).unwrap();
        assert_eq!(EngineConfig::from_document(&doc).unwrap(), original);
    }

    #[test]
    fn test_ron_roundtrip_through_serde() {
        let mut original = EngineConfig::default();
        original.terrain.region_size = 48;
        let text = ron::ser::to_string(&original).unwrap();
        let parsed: EngineConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_validate_rejects_zero_region_size() {
        let mut config = EngineConfig::default();
        config.terrain.region_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_overflowing_terrain() {
        let mut config = EngineConfig::default();
        config.terrain.region_size = 30_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.terrain.proximity_radius = 1 << 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_shader_path_joins_directory() {
        let renderer = RendererConfig::default();
        assert_eq!(
            renderer.shader_path("a.spv"),
            Path::new("target/shaders").join("a.spv")
        );
    }
}
