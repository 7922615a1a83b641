//! Instance transform buffers and their descriptor sets, per swapchain image
//!
//! Wraps a [`BatchMap`] with the GPU side every per-type renderer shares:
//! one storage buffer of transforms per batch entry and one descriptor pool
//! per image holding exactly one instance set per entry. The pool is only
//! rebuilt after an insertion, so frames that merely move objects never touch
//! descriptors.

use ash::{vk, Device};

use crate::foundation::math::{utils, GpuMat4, Mat4};
use crate::render::batch::{unique_id, BatchMap, DrawOutcome};
use crate::render::vulkan::{Buffer, DescriptorLayout, DescriptorPool, DescriptorSet, VulkanContext, VulkanResult};

/// GPU state of one batch entry
pub struct InstanceSlot {
    transforms: Buffer,
    descriptor_set: Option<DescriptorSet>,
}

/// Snapshot of a live entry handed to a recording job
#[derive(Debug, Clone, Copy)]
pub struct InstanceDraw<H> {
    /// Batch key
    pub id: u64,
    /// Resource drawn
    pub handle: H,
    /// Instances in the draw
    pub instance_count: u32,
    /// First instance's transform
    pub transform: Mat4,
    /// Set holding the instance transforms
    pub instance_set: vk::DescriptorSet,
}

/// Batch map plus per-image descriptor pools for instance transforms
pub struct InstanceBatcher<H> {
    device: Device,
    name: &'static str,
    layout: DescriptorLayout,
    pools: Vec<DescriptorPool>,
    batches: BatchMap<H, InstanceSlot>,
}

impl<H: Copy> InstanceBatcher<H> {
    /// Create the instance layout (binding 0: storage buffer of `mat4`) and empty maps
    pub fn new(device: &Device, name: &'static str, image_count: usize) -> VulkanResult<Self> {
        let mut layout = DescriptorLayout::new().with(vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX);
        layout.init(device)?;
        Ok(Self {
            device: device.clone(),
            name,
            layout,
            pools: (0..image_count).map(|_| DescriptorPool::new()).collect(),
            batches: BatchMap::new(image_count),
        })
    }

    /// Layout bound at the instance set index of the renderer's pipeline
    pub fn instance_layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    /// Mark every entry of `image` as not drawn; drops everything after an aborted frame
    pub fn begin(&mut self, image: usize) {
        let released = self.batches.begin(image);
        if !released.is_empty() {
            log::debug!("{}: cleared {} batches for image {image}", self.name, released.len());
            self.pools[image] = DescriptorPool::new();
        }
    }

    /// Insert or refresh the entry for `(resource_id, transforms.len())`
    pub fn draw(
        &mut self,
        ctx: &VulkanContext,
        image: usize,
        resource_id: u32,
        handle: H,
        transforms: &[Mat4],
    ) -> VulkanResult<DrawOutcome> {
        let count = transforms.len() as u32;
        let id = unique_id(resource_id, count);
        let outcome = self.batches.draw(image, id, handle, transforms, || {
            let size = (std::mem::size_of::<GpuMat4>() * transforms.len()) as vk::DeviceSize;
            let transforms = Buffer::host_visible(ctx, size, vk::BufferUsageFlags::STORAGE_BUFFER)?;
            Ok::<_, crate::render::vulkan::VulkanError>(InstanceSlot {
                transforms,
                descriptor_set: None,
            })
        })?;
        if outcome == DrawOutcome::Inserted {
            log::trace!("{}: new batch {id:#x} on image {image}", self.name);
        }
        Ok(outcome)
    }

    /// Rebuild descriptors if entries were added, then upload every drawn entry's transforms
    pub fn prepare(&mut self, image: usize) -> VulkanResult<()> {
        if self.batches.is_dirty(image) {
            let evicted = self.batches.evict_stale(image);
            drop(evicted);

            // Old sets die with the old pool
            let mut pool = DescriptorPool::new();
            pool.add_descriptor_layout(&self.layout, self.batches.len(image) as u32);
            pool.init(&self.device, 1)?;

            for (_, batch) in self.batches.entries_mut(image) {
                let mut set = pool.allocate(&self.layout)?;
                set.set_buffer_desc(0, batch.gpu.transforms.descriptor_info())?;
                set.update(&self.device);
                batch.gpu.descriptor_set = Some(set);
            }
            log::debug!(
                "{}: rebuilt descriptor pool for image {image} with {} sets",
                self.name,
                pool.capacity()
            );
            self.pools[image] = pool;
            self.batches.finish(image);
        }

        for (_, batch) in self.batches.live(image) {
            let matrices: Vec<GpuMat4> = batch.transforms.iter().map(utils::to_gpu).collect();
            batch.gpu.transforms.write_pod(&matrices)?;
        }
        Ok(())
    }

    /// Entries drawn this frame, with their instance sets
    pub fn live(&self, image: usize) -> Vec<InstanceDraw<H>> {
        self.batches
            .live(image)
            .filter_map(|(id, batch)| {
                let set = batch.gpu.descriptor_set.as_ref()?;
                Some(InstanceDraw {
                    id,
                    handle: batch.handle,
                    instance_count: batch.transforms.len() as u32,
                    transform: batch.transforms.first().copied().unwrap_or_else(Mat4::identity),
                    instance_set: set.handle(),
                })
            })
            .collect()
    }

    /// Force every image to start from an empty map on its next frame
    pub fn mark_all_dirty(&mut self) {
        self.batches.mark_all_dirty();
    }

    /// Entry count for `image`, drawn or not
    pub fn len(&self, image: usize) -> usize {
        self.batches.len(image)
    }

    /// Whether `image` has no entries
    pub fn is_empty(&self, image: usize) -> bool {
        self.batches.is_empty(image)
    }
}
