//! Draw batches keyed by (resource id, instance count)
//!
//! Each swapchain image has its own map. Entries are never removed just
//! because a frame did not draw them; they are only dropped while the image's
//! descriptor pool is being rebuilt, which happens after an insertion.

use std::collections::BTreeMap;

use crate::foundation::math::Mat4;

/// Combine a resource id and an instance count into one batch key
pub fn unique_id(resource_id: u32, instance_count: u32) -> u64 {
    (u64::from(resource_id) << 32) | u64::from(instance_count)
}

/// Inverse of [`unique_id`]
pub fn split_unique_id(id: u64) -> (u32, u32) {
    ((id >> 32) as u32, (id & 0xFFFF_FFFF) as u32)
}

/// One batch: the resource drawn, its instance transforms and GPU state `G`
#[derive(Debug)]
pub struct DrawBatch<H, G> {
    /// Resource handle, refreshed on every draw
    pub handle: H,
    /// Latest instance transforms
    pub transforms: Vec<Mat4>,
    /// Drawn since the last `begin`
    pub exists: bool,
    /// Per-entry GPU resources
    pub gpu: G,
}

/// What a draw call did to the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// New entry; the image's descriptors are now dirty
    Inserted,
    /// Existing entry revived or refreshed
    Updated,
}

#[derive(Debug)]
struct ImageBatches<H, G> {
    entries: BTreeMap<u64, DrawBatch<H, G>>,
    dirty: bool,
}

impl<H, G> Default for ImageBatches<H, G> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            dirty: false,
        }
    }
}

impl<H, G> ImageBatches<H, G> {
    fn drain(&mut self) -> Vec<G> {
        std::mem::take(&mut self.entries).into_values().map(|batch| batch.gpu).collect()
    }
}

/// Per-image batch maps with a descriptors-dirty flag each
#[derive(Debug)]
pub struct BatchMap<H, G> {
    images: Vec<ImageBatches<H, G>>,
}

impl<H: Copy, G> BatchMap<H, G> {
    /// Empty maps for `image_count` swapchain images
    pub fn new(image_count: usize) -> Self {
        Self {
            images: (0..image_count).map(|_| ImageBatches::default()).collect(),
        }
    }

    /// Start a frame for `image`: every entry is marked not drawn.
    ///
    /// If the previous bracket for this image inserted entries but never
    /// reached [`Self::finish`], the whole map is cleared and its GPU state
    /// returned for destruction.
    pub fn begin(&mut self, image: usize) -> Vec<G> {
        let batches = &mut self.images[image];
        let released = if batches.dirty {
            batches.dirty = false;
            batches.drain()
        } else {
            Vec::new()
        };
        for batch in batches.entries.values_mut() {
            batch.exists = false;
        }
        released
    }

    /// Record a draw of `handle` with `transforms`.
    ///
    /// `create` builds the GPU state for a new entry and only runs on insert.
    pub fn draw<E>(
        &mut self,
        image: usize,
        id: u64,
        handle: H,
        transforms: &[Mat4],
        create: impl FnOnce() -> Result<G, E>,
    ) -> Result<DrawOutcome, E> {
        let batches = &mut self.images[image];
        if let Some(batch) = batches.entries.get_mut(&id) {
            batch.handle = handle;
            batch.transforms.clear();
            batch.transforms.extend_from_slice(transforms);
            batch.exists = true;
            return Ok(DrawOutcome::Updated);
        }

        let gpu = create()?;
        batches.entries.insert(
            id,
            DrawBatch {
                handle,
                transforms: transforms.to_vec(),
                exists: true,
                gpu,
            },
        );
        batches.dirty = true;
        Ok(DrawOutcome::Inserted)
    }

    /// Whether `image` needs its descriptor pool rebuilt
    pub fn is_dirty(&self, image: usize) -> bool {
        self.images[image].dirty
    }

    /// Mark every image dirty so the next `begin` starts from an empty map
    pub fn mark_all_dirty(&mut self) {
        for batches in &mut self.images {
            batches.dirty = true;
        }
    }

    /// Remove entries not drawn this frame, returning their GPU state
    pub fn evict_stale(&mut self, image: usize) -> Vec<G> {
        let batches = &mut self.images[image];
        let stale: Vec<u64> = batches
            .entries
            .iter()
            .filter(|(_, batch)| !batch.exists)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| batches.entries.remove(&id))
            .map(|batch| batch.gpu)
            .collect()
    }

    /// Descriptors for `image` are rebuilt
    pub fn finish(&mut self, image: usize) {
        self.images[image].dirty = false;
    }

    /// Entries drawn this frame
    pub fn live(&self, image: usize) -> impl Iterator<Item = (u64, &DrawBatch<H, G>)> {
        self.images[image]
            .entries
            .iter()
            .filter(|(_, batch)| batch.exists)
            .map(|(id, batch)| (*id, batch))
    }

    /// Every entry, drawn or not
    pub fn entries_mut(&mut self, image: usize) -> impl Iterator<Item = (u64, &mut DrawBatch<H, G>)> {
        self.images[image].entries.iter_mut().map(|(id, batch)| (*id, batch))
    }

    /// Entry count for `image`
    pub fn len(&self, image: usize) -> usize {
        self.images[image].entries.len()
    }

    /// Whether `image` has no entries
    pub fn is_empty(&self, image: usize) -> bool {
        self.images[image].entries.is_empty()
    }

    /// Entry lookup
    pub fn get(&self, image: usize, id: u64) -> Option<&DrawBatch<H, G>> {
        self.images[image].entries.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use std::convert::Infallible;

    /// Stand-in for GPU state that counts descriptor rebuilds
    #[derive(Debug, Default)]
    struct FakeGpu {
        serial: u32,
    }

    struct Harness {
        map: BatchMap<u32, FakeGpu>,
        created: u32,
        rebuilds: u32,
    }

    impl Harness {
        fn new(images: usize) -> Self {
            Self {
                map: BatchMap::new(images),
                created: 0,
                rebuilds: 0,
            }
        }

        fn draw(&mut self, image: usize, model: u32, transforms: &[Mat4]) -> DrawOutcome {
            let id = unique_id(model, transforms.len() as u32);
            let serial = self.created;
            let outcome = self
                .map
                .draw(image, id, model, transforms, || Ok::<_, Infallible>(FakeGpu { serial }))
                .unwrap();
            if outcome == DrawOutcome::Inserted {
                self.created += 1;
            }
            outcome
        }

        // Mirrors what a renderer does at end of frame
        fn end(&mut self, image: usize) {
            if self.map.is_dirty(image) {
                self.map.evict_stale(image);
                self.rebuilds += 1;
                self.map.finish(image);
            }
        }
    }

    fn translations(count: usize, offset: f32) -> Vec<Mat4> {
        (0..count)
            .map(|i| Mat4::new_translation(&Vec3::new(i as f32 + offset, 0.0, 0.0)))
            .collect()
    }

    #[test]
    fn test_unique_id_round_trips_extremes() {
        for (model, count) in [(0, 0), (1, 5), (u32::MAX, 0), (0, u32::MAX), (u32::MAX, u32::MAX)] {
            assert_eq!(split_unique_id(unique_id(model, count)), (model, count));
        }
    }

    #[test]
    fn test_unique_id_separates_model_from_count() {
        assert_ne!(unique_id(1, 0), unique_id(0, 1));
        assert_eq!(unique_id(2, 3), (2 << 32) | 3);
    }

    #[test]
    fn test_repeated_draws_share_one_entry_and_one_rebuild() {
        let mut h = Harness::new(2);
        h.map.begin(0);
        for offset in 0..4 {
            h.draw(0, 7, &translations(3, offset as f32));
        }
        h.end(0);

        assert_eq!(h.map.len(0), 1);
        assert_eq!(h.created, 1);
        assert_eq!(h.rebuilds, 1);
    }

    #[test]
    fn test_second_transform_array_wins() {
        let mut h = Harness::new(1);
        h.map.begin(0);
        h.draw(0, 3, &translations(5, 0.0));
        let second = translations(5, 100.0);
        assert_eq!(h.draw(0, 3, &second), DrawOutcome::Updated);
        h.end(0);

        let batch = h.map.get(0, unique_id(3, 5)).unwrap();
        assert_eq!(batch.transforms, second);
        assert_eq!(h.map.live(0).count(), 1);
    }

    #[test]
    fn test_undrawn_entry_survives_and_revives() {
        let mut h = Harness::new(1);
        let id = unique_id(9, 1);

        h.map.begin(0);
        h.draw(0, 9, &translations(1, 0.0));
        h.end(0);

        h.map.begin(0);
        h.end(0);
        let batch = h.map.get(0, id).unwrap();
        assert!(!batch.exists);
        assert_eq!(h.map.live(0).count(), 0);

        h.map.begin(0);
        assert_eq!(h.draw(0, 9, &translations(1, 0.0)), DrawOutcome::Updated);
        h.end(0);

        let batch = h.map.get(0, id).unwrap();
        assert!(batch.exists);
        assert_eq!(batch.gpu.serial, 0);
        assert_eq!(h.created, 1);
        assert_eq!(h.rebuilds, 1);
    }

    #[test]
    fn test_stale_entries_go_only_when_pool_rebuilds() {
        let mut h = Harness::new(1);
        h.map.begin(0);
        h.draw(0, 1, &translations(1, 0.0));
        h.draw(0, 2, &translations(1, 0.0));
        h.end(0);

        // Model 1 skipped, model 3 added: the rebuild drops model 1
        h.map.begin(0);
        h.draw(0, 2, &translations(1, 0.0));
        h.draw(0, 3, &translations(1, 0.0));
        h.end(0);

        assert!(h.map.get(0, unique_id(1, 1)).is_none());
        assert!(h.map.get(0, unique_id(2, 1)).is_some());
        assert!(h.map.get(0, unique_id(3, 1)).is_some());
        assert_eq!(h.rebuilds, 2);
    }

    #[test]
    fn test_new_instance_count_is_a_new_entry() {
        let mut h = Harness::new(1);
        h.map.begin(0);
        h.draw(0, 4, &translations(2, 0.0));
        assert_eq!(h.draw(0, 4, &translations(3, 0.0)), DrawOutcome::Inserted);
        assert_eq!(h.map.len(0), 2);
    }

    #[test]
    fn test_images_are_independent() {
        let mut h = Harness::new(3);
        h.map.begin(1);
        h.draw(1, 4, &translations(1, 0.0));
        assert!(h.map.is_dirty(1));
        assert!(!h.map.is_dirty(0));
        assert!(h.map.is_empty(0));
        assert!(h.map.is_empty(2));
    }

    #[test]
    fn test_aborted_frame_clears_map_on_next_begin() {
        let mut h = Harness::new(1);
        h.map.begin(0);
        h.draw(0, 1, &translations(1, 0.0));
        h.end(0);
        h.map.begin(0);
        h.draw(0, 2, &translations(1, 0.0));
        // No end: the swapchain went stale mid-frame

        let released = h.map.begin(0);
        assert_eq!(released.len(), 2);
        assert!(h.map.is_empty(0));
        assert!(!h.map.is_dirty(0));
    }

    #[test]
    fn test_begin_on_clean_map_releases_nothing() {
        let mut h = Harness::new(1);
        h.map.begin(0);
        h.draw(0, 1, &translations(1, 0.0));
        h.end(0);
        assert!(h.map.begin(0).is_empty());
        assert_eq!(h.map.len(0), 1);
    }

    #[test]
    fn test_failed_create_leaves_map_untouched() {
        let mut map: BatchMap<u32, FakeGpu> = BatchMap::new(1);
        map.begin(0);
        let result = map.draw(0, unique_id(1, 1), 1, &translations(1, 0.0), || Err("out of memory"));
        assert_eq!(result.unwrap_err(), "out of memory");
        assert!(map.is_empty(0));
        assert!(!map.is_dirty(0));
    }
}
