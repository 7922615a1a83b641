//! Typed registry keys
//!
//! Models, cube maps and terrains live in slot maps owned by the application.
//! Renderers hold keys instead of references, so an asset removed from its
//! registry is skipped at record time rather than dangling.

pub use slotmap::{Key, SlotMap};

slotmap::new_key_type! {
    /// Key of a model in the model registry
    pub struct ModelKey;

    /// Key of a cube map in the cube map registry
    pub struct CubeMapKey;

    /// Key of a terrain in the terrain registry
    pub struct TerrainKey;
}

/// Stable 32-bit identifier of a registry entry, used as the high half of batch ids.
///
/// The slot index is unique among live entries of one registry.
pub fn key_id<K: Key>(key: K) -> u32 {
    // as_ffi packs the version into the high 32 bits and the slot index into the low 32
    (key.data().as_ffi() & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ids_are_distinct_for_live_entries() {
        let mut registry: SlotMap<ModelKey, &str> = SlotMap::with_key();
        let a = registry.insert("a");
        let b = registry.insert("b");
        let c = registry.insert("c");
        assert_ne!(key_id(a), key_id(b));
        assert_ne!(key_id(b), key_id(c));
        assert_ne!(key_id(a), key_id(c));
    }

    #[test]
    fn test_key_id_survives_lookup_roundtrip() {
        let mut registry: SlotMap<TerrainKey, u32> = SlotMap::with_key();
        let key = registry.insert(42);
        let id = key_id(key);
        let found = registry.keys().find(|k| key_id(*k) == id);
        assert_eq!(found, Some(key));
    }
}
