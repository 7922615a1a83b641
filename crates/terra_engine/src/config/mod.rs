//! Configuration system
//!
//! Typed sections are (de)serialized through serde from TOML or RON. TOML
//! documents can also be queried with slash separated key paths such as
//! `"Display/defaultWidth"`; path segments match table keys ignoring case and
//! underscores, so that path resolves `[display] default_width`.

mod engine;

pub use engine::{DebugLayerConfig, DisplayConfig, EngineConfig, RendererConfig, TerrainConfig};
pub use serde::{Deserialize, Serialize};

use std::path::Path;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from a `.toml` or `.ron` file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A key path did not resolve to a value
    #[error("Missing configuration key: {0}")]
    MissingKey(String),

    /// A key path resolved to a value of the wrong type
    #[error("Configuration key {path} is not a {expected}")]
    WrongType {
        /// Key path that was looked up
        path: String,
        /// Expected value kind
        expected: &'static str,
    },

    /// A section failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A parsed TOML document queried by key path
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: toml::Table,
}

impl ConfigDocument {
    /// Parse a TOML document
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root = text
            .parse::<toml::Table>()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self { root })
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Resolve a key path like `"Terrain/regionSize"`
    pub fn get(&self, path: &str) -> Option<&toml::Value> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next()?;
        let mut current = lookup(&self.root, first)?;
        for segment in segments {
            current = lookup(current.as_table()?, segment)?;
        }
        Some(current)
    }

    /// Integer value at `path`
    pub fn get_u32(&self, path: &str) -> Result<u32, ConfigError> {
        let value = self.require(path)?;
        value
            .as_integer()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| wrong_type(path, "non-negative 32-bit integer"))
    }

    /// Float value at `path`; integers are accepted and widened
    pub fn get_f32(&self, path: &str) -> Result<f32, ConfigError> {
        match self.require(path)? {
            toml::Value::Float(v) => Ok(*v as f32),
            toml::Value::Integer(v) => Ok(*v as f32),
            _ => Err(wrong_type(path, "number")),
        }
    }

    /// Boolean value at `path`
    pub fn get_bool(&self, path: &str) -> Result<bool, ConfigError> {
        self.require(path)?
            .as_bool()
            .ok_or_else(|| wrong_type(path, "boolean"))
    }

    /// String value at `path`
    pub fn get_str(&self, path: &str) -> Result<&str, ConfigError> {
        self.require(path)?
            .as_str()
            .ok_or_else(|| wrong_type(path, "string"))
    }

    /// Integer value at `path`, or `default` when the key is absent
    pub fn u32_or(&self, path: &str, default: u32) -> Result<u32, ConfigError> {
        or_default(self.get_u32(path), default)
    }

    /// Float value at `path`, or `default` when the key is absent
    pub fn f32_or(&self, path: &str, default: f32) -> Result<f32, ConfigError> {
        or_default(self.get_f32(path), default)
    }

    /// Boolean value at `path`, or `default` when the key is absent
    pub fn bool_or(&self, path: &str, default: bool) -> Result<bool, ConfigError> {
        or_default(self.get_bool(path), default)
    }

    /// String value at `path`, or `default` when the key is absent
    pub fn string_or(&self, path: &str, default: &str) -> Result<String, ConfigError> {
        or_default(self.get_str(path).map(str::to_owned), default.to_owned())
    }

    fn require(&self, path: &str) -> Result<&toml::Value, ConfigError> {
        self.get(path).ok_or_else(|| ConfigError::MissingKey(path.to_string()))
    }
}

fn lookup<'a>(table: &'a toml::Table, segment: &str) -> Option<&'a toml::Value> {
    let wanted = normalize_key(segment);
    table
        .iter()
        .find(|(key, _)| normalize_key(key) == wanted)
        .map(|(_, value)| value)
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn wrong_type(path: &str, expected: &'static str) -> ConfigError {
    ConfigError::WrongType {
        path: path.to_string(),
        expected,
    }
}

fn or_default<T>(result: Result<T, ConfigError>, default: T) -> Result<T, ConfigError> {
    match result {
        Err(ConfigError::MissingKey(_)) => Ok(default),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[display]
title = "Sandbox"
default_width = 1280
default_height = 720

[debug_layer]
active = true

[terrain]
region_size = 64
vertex_spacing = 1
"#;

    #[test]
    fn test_key_path_ignores_case_and_underscores() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.get_u32("Display/defaultWidth").unwrap(), 1280);
        assert_eq!(doc.get_u32("display/DEFAULT_HEIGHT").unwrap(), 720);
        assert!(doc.get_bool("Debuglayer/active").unwrap());
        assert_eq!(doc.get_str("Display/title").unwrap(), "Sandbox");
    }

    #[test]
    fn test_missing_key_reports_path() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        match doc.get_u32("Display/refreshRate") {
            Err(ConfigError::MissingKey(path)) => assert_eq!(path, "Display/refreshRate"),
            other => panic!("expected missing key, got {other:?}"),
        }
        assert_eq!(doc.u32_or("Display/refreshRate", 60).unwrap(), 60);
    }

    #[test]
    fn test_wrong_type_is_not_defaulted() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        assert!(matches!(
            doc.u32_or("Display/title", 5),
            Err(ConfigError::WrongType { .. })
        ));
    }

    #[test]
    fn test_integer_widens_to_float() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.get_f32("Terrain/vertexSpacing").unwrap(), 1.0);
    }

    #[test]
    fn test_load_rejects_non_toml_paths() {
        assert!(matches!(
            ConfigDocument::load("settings.ini"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
