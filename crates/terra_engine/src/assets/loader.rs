//! Background model loading with a main-thread GPU handoff
//!
//! Parsing runs on the loader worker and only produces a [`ModelData`]. The
//! result is pushed on a mutex-guarded queue that the main thread drains once
//! per frame in [`AssetLoader::update`], where every Vulkan object is created.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use slotmap::SlotMap;

use crate::assets::{AssetError, MaterialData, Model, ModelData};
use crate::foundation::collections::{key_id, ModelKey};
use crate::render::layouts::SetLayouts;
use crate::render::vulkan::{CommandPool, VulkanContext, VulkanResult};
use crate::threading::{ThreadManager, LOADER_THREAD};

/// CPU-side parser turning a path into model data
pub trait AssetSource: Send + Sync {
    /// Parse `path`
    fn load(&self, path: &Path) -> Result<ModelData, AssetError>;
}

/// Built-in shapes addressed by name: `cube`, `plane`, optionally `name:r,g,b`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProceduralSource;

impl AssetSource for ProceduralSource {
    fn load(&self, path: &Path) -> Result<ModelData, AssetError> {
        let name = path.to_string_lossy();
        let (shape, color) = match name.split_once(':') {
            Some((shape, color)) => (shape, parse_color(color)?),
            None => (&*name, [1.0, 1.0, 1.0, 1.0]),
        };
        let material = MaterialData::colored(color);
        match shape {
            "cube" => Ok(ModelData::cube(1.0, material)),
            "plane" => Ok(ModelData::plane(10.0, 10, material)),
            other => Err(AssetError::NotFound(other.to_string())),
        }
    }
}

fn parse_color(text: &str) -> Result<[f32; 4], AssetError> {
    let channels = text
        .split(',')
        .map(|c| c.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AssetError::Invalid(format!("bad color '{text}': {e}")))?;
    match channels.as_slice() {
        [r, g, b] => Ok([*r, *g, *b, 1.0]),
        [r, g, b, a] => Ok([*r, *g, *b, *a]),
        _ => Err(AssetError::Invalid(format!("bad color '{text}': expected 3 or 4 channels"))),
    }
}

/// Parsed model waiting for its GPU upload
#[derive(Debug)]
pub struct PendingUpload {
    /// Model the data belongs to
    pub key: ModelKey,
    /// Source path, for diagnostics
    pub path: PathBuf,
    /// Parse result
    pub result: Result<ModelData, AssetError>,
}

/// Loads models on the loader worker and uploads them on the main thread
pub struct AssetLoader {
    threads: Arc<ThreadManager>,
    source: Arc<dyn AssetSource>,
    ready: Arc<Mutex<VecDeque<PendingUpload>>>,
}

impl AssetLoader {
    /// Loader parsing with `source`
    pub fn new(threads: Arc<ThreadManager>, source: Arc<dyn AssetSource>) -> Self {
        Self {
            threads,
            source,
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Parse `path` for `key` in the background
    pub fn load_on_thread(&self, path: impl Into<PathBuf>, key: ModelKey) {
        let path = path.into();
        let source = Arc::clone(&self.source);
        let ready = Arc::clone(&self.ready);
        log::info!("Loading model {:?}", path);

        self.threads.add_work(LOADER_THREAD, u64::from(key_id(key)), move || {
            let result = source.load(&path).and_then(|data| data.validate().map(|()| data));
            ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(PendingUpload { key, path, result });
        });
    }

    /// Take everything parsed so far
    pub fn drain(&self) -> Vec<PendingUpload> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    /// Upload every parsed model; call once per frame on the main thread before drawing.
    ///
    /// Returns how many models became drawable. Parse failures are logged and
    /// leave the model unloaded.
    pub fn update(
        &self,
        ctx: &VulkanContext,
        pool: &CommandPool,
        layouts: &SetLayouts,
        models: &mut SlotMap<ModelKey, Model>,
    ) -> VulkanResult<usize> {
        let mut uploaded = 0;
        for pending in self.drain() {
            let data = match pending.result {
                Ok(data) => data,
                Err(err) => {
                    log::error!("Failed to load model {:?}: {}", pending.path, err);
                    continue;
                }
            };
            match models.get_mut(pending.key) {
                Some(model) => {
                    model.upload(ctx, pool, layouts, data)?;
                    uploaded += 1;
                }
                None => log::debug!("Model {:?} was removed before its upload", pending.path),
            }
        }
        Ok(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<ModelKey> {
        let mut map: SlotMap<ModelKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn loader() -> (Arc<ThreadManager>, AssetLoader) {
        let threads = Arc::new(ThreadManager::new(crate::threading::ENGINE_THREAD_COUNT).unwrap());
        let loader = AssetLoader::new(Arc::clone(&threads), Arc::new(ProceduralSource));
        (threads, loader)
    }

    #[test]
    fn test_parsed_models_arrive_in_request_order() {
        let (threads, loader) = loader();
        let keys = keys(2);
        loader.load_on_thread("cube", keys[0]);
        loader.load_on_thread("plane:0.5,0.5,0.5", keys[1]);
        threads.wait(LOADER_THREAD);

        let pending = loader.drain();
        assert_eq!(pending.iter().map(|p| p.key).collect::<Vec<_>>(), keys);
        let plane = pending[1].result.as_ref().unwrap();
        assert_eq!(plane.materials[0].base_color, [0.5, 0.5, 0.5, 1.0]);
        assert!(loader.drain().is_empty());
    }

    #[test]
    fn test_failures_are_delivered_not_dropped() {
        let (threads, loader) = loader();
        let key = keys(1)[0];
        loader.load_on_thread("crate", key);
        threads.wait(LOADER_THREAD);

        let pending = loader.drain();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].result, Err(AssetError::NotFound(_))));
    }

    #[test]
    fn test_invalid_data_is_rejected_on_the_worker() {
        struct Broken;
        impl AssetSource for Broken {
            fn load(&self, _path: &Path) -> Result<ModelData, AssetError> {
                let mut data = ModelData::cube(1.0, MaterialData::colored([1.0; 4]));
                data.roots.push(42);
                Ok(data)
            }
        }

        let threads = Arc::new(ThreadManager::new(crate::threading::ENGINE_THREAD_COUNT).unwrap());
        let loader = AssetLoader::new(Arc::clone(&threads), Arc::new(Broken));
        loader.load_on_thread("broken", keys(1)[0]);
        threads.wait(LOADER_THREAD);
        assert!(matches!(loader.drain()[0].result, Err(AssetError::Invalid(_))));
    }

    #[test]
    fn test_color_parsing() {
        assert_eq!(parse_color("1,0,0").unwrap(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(parse_color("0.1, 0.2, 0.3, 0.4").unwrap(), [0.1, 0.2, 0.3, 0.4]);
        assert!(parse_color("red").is_err());
        assert!(parse_color("1,2").is_err());
    }
}
