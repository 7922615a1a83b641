//! Descriptor layouts, pools and sets
//!
//! A [`DescriptorLayout`] records bindings in the order they are added and
//! merges runs of consecutive bindings that share a descriptor type, stage
//! mask and array size into write groups. A [`DescriptorSet`] buffers the
//! resources assigned to it and flushes each group with a single
//! `VkWriteDescriptorSet`, relying on Vulkan's consecutive-binding update rule.
//!
//! A [`DescriptorPool`] is sized up front from the layouts it will serve and
//! is recreated wholesale rather than freed set by set.

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// One binding in a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    /// Binding number
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array size of the binding
    pub count: u32,
    /// Shader stages that see the binding
    pub stages: vk::ShaderStageFlags,
}

/// A run of consecutive bindings written together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGroup {
    /// Shared descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Shared stage mask
    pub stages: vk::ShaderStageFlags,
    /// Lowest binding in the group
    pub first_binding: u32,
    /// Number of bindings in the group
    pub binding_count: u32,
    /// Array size of every binding in the group
    pub descriptors_per_binding: u32,
}

impl WriteGroup {
    /// Whether `binding` belongs to this group
    pub fn contains(&self, binding: u32) -> bool {
        binding >= self.first_binding && binding < self.first_binding + self.binding_count
    }

    /// Total descriptors across the group
    pub fn descriptor_count(&self) -> u32 {
        self.binding_count * self.descriptors_per_binding
    }

    fn slot(&self, binding: u32, element: u32) -> usize {
        ((binding - self.first_binding) * self.descriptors_per_binding + element) as usize
    }
}

fn is_buffer_type(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

/// Descriptor set layout assembled binding by binding
pub struct DescriptorLayout {
    bindings: Vec<BindingDesc>,
    groups: Vec<WriteGroup>,
    device: Option<Device>,
    layout: vk::DescriptorSetLayout,
}

impl Default for DescriptorLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorLayout {
    /// Empty layout; populate with [`Self::add`] then call [`Self::init`]
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            groups: Vec::new(),
            device: None,
            layout: vk::DescriptorSetLayout::null(),
        }
    }

    /// Append a binding and return its number
    pub fn add(&mut self, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags, count: u32) -> u32 {
        let binding = self.bindings.len() as u32;
        let count = count.max(1);
        self.bindings.push(BindingDesc {
            binding,
            descriptor_type,
            count,
            stages,
        });

        match self.groups.last_mut() {
            Some(group)
                if group.descriptor_type == descriptor_type
                    && group.stages == stages
                    && group.descriptors_per_binding == count
                    && group.first_binding + group.binding_count == binding =>
            {
                group.binding_count += 1;
            }
            _ => self.groups.push(WriteGroup {
                descriptor_type,
                stages,
                first_binding: binding,
                binding_count: 1,
                descriptors_per_binding: count,
            }),
        }
        binding
    }

    /// Builder-style [`Self::add`] with a single descriptor
    pub fn with(mut self, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.add(descriptor_type, stages, 1);
        self
    }

    /// Bindings in add order
    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }

    /// Write groups in add order
    pub fn write_groups(&self) -> &[WriteGroup] {
        &self.groups
    }

    /// Group containing `binding`, found by membership so lookup holds for any add order
    pub fn write_group_for(&self, binding: u32) -> Option<(usize, &WriteGroup)> {
        self.groups.iter().enumerate().find(|(_, group)| group.contains(binding))
    }

    /// Pool capacity needed for `instances` sets of this layout
    pub fn pool_sizes(&self, instances: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for group in &self.groups {
            let count = group.descriptor_count() * instances;
            match sizes.iter_mut().find(|size| size.ty == group.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: group.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }

    /// Create the Vulkan layout object
    pub fn init(&mut self, device: &Device) -> VulkanResult<()> {
        if self.device.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "Descriptor layout initialised twice".to_string(),
            });
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        self.layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };
        self.device = Some(device.clone());
        Ok(())
    }

    /// Layout handle, null until [`Self::init`]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorLayout {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            unsafe { device.destroy_descriptor_set_layout(self.layout, None) };
        }
    }
}

/// Pool sized from the layouts and set counts registered before [`Self::init`]
pub struct DescriptorPool {
    requests: Vec<(Vec<vk::DescriptorPoolSize>, u32)>,
    device: Option<Device>,
    pool: vk::DescriptorPool,
    capacity: u32,
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorPool {
    /// Pool with no requirements yet
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            device: None,
            pool: vk::DescriptorPool::null(),
            capacity: 0,
        }
    }

    /// Reserve room for `count` sets of `layout`
    pub fn add_descriptor_layout(&mut self, layout: &DescriptorLayout, count: u32) {
        if count > 0 {
            self.requests.push((layout.pool_sizes(1), count));
        }
    }

    /// Merged descriptor counts for `copies` repetitions of every request
    pub fn required_sizes(&self, copies: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for (per_set, count) in &self.requests {
            for size in per_set {
                let total = size.descriptor_count * count * copies;
                match sizes.iter_mut().find(|s| s.ty == size.ty) {
                    Some(existing) => existing.descriptor_count += total,
                    None => sizes.push(vk::DescriptorPoolSize {
                        ty: size.ty,
                        descriptor_count: total,
                    }),
                }
            }
        }
        sizes
    }

    /// Sets needed for `copies` repetitions of every request
    pub fn max_sets(&self, copies: u32) -> u32 {
        self.requests.iter().map(|(_, count)| count).sum::<u32>() * copies
    }

    /// Create the pool; with no requests nothing is created and allocation fails
    pub fn init(&mut self, device: &Device, copies: u32) -> VulkanResult<()> {
        if self.device.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "Descriptor pool initialised twice".to_string(),
            });
        }

        let max_sets = self.max_sets(copies);
        if max_sets > 0 {
            let sizes = self.required_sizes(copies);
            let pool_info = vk::DescriptorPoolCreateInfo::builder()
                .max_sets(max_sets)
                .pool_sizes(&sizes);
            self.pool = unsafe { device.create_descriptor_pool(&pool_info, None).map_err(VulkanError::Api)? };
            log::trace!("Created descriptor pool for {max_sets} sets");
        }
        self.capacity = max_sets;
        self.device = Some(device.clone());
        Ok(())
    }

    /// Allocate one set of `layout`
    pub fn allocate(&self, layout: &DescriptorLayout) -> VulkanResult<DescriptorSet> {
        let device = self.device.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Descriptor pool used before init".to_string(),
        })?;
        if self.pool == vk::DescriptorPool::null() {
            return Err(VulkanError::InvalidOperation {
                reason: "Descriptor pool has no capacity".to_string(),
            });
        }

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info).map_err(VulkanError::Api)? }
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Descriptor set allocation returned nothing".to_string(),
            })?;

        Ok(DescriptorSet::new(set, layout))
    }

    /// Sets the pool was sized for
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pool handle, null when empty or uninitialised
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            if self.pool != vk::DescriptorPool::null() {
                unsafe { device.destroy_descriptor_pool(self.pool, None) };
            }
        }
    }
}

/// Contiguous pending descriptors inside one write group, flushed as one write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRun {
    /// Index of the group in the layout
    pub group: usize,
    /// Binding the write starts at
    pub dst_binding: u32,
    /// Array element the write starts at
    pub dst_array_element: u32,
    /// Descriptors covered
    pub descriptor_count: u32,
    /// Descriptor type of the group
    pub descriptor_type: vk::DescriptorType,
    first_slot: usize,
}

enum PendingSlots {
    Buffers(Vec<Option<vk::DescriptorBufferInfo>>),
    Images(Vec<Option<vk::DescriptorImageInfo>>),
}

impl PendingSlots {
    fn is_set(&self, slot: usize) -> bool {
        match self {
            Self::Buffers(slots) => slots[slot].is_some(),
            Self::Images(slots) => slots[slot].is_some(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Buffers(slots) => slots.len(),
            Self::Images(slots) => slots.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Buffers(slots) => slots.iter_mut().for_each(|s| *s = None),
            Self::Images(slots) => slots.iter_mut().for_each(|s| *s = None),
        }
    }
}

/// An allocated set plus the resources waiting to be written into it
pub struct DescriptorSet {
    set: vk::DescriptorSet,
    groups: Vec<WriteGroup>,
    pending: Vec<PendingSlots>,
}

impl DescriptorSet {
    /// Wrap `set`, which was allocated with `layout`
    pub fn new(set: vk::DescriptorSet, layout: &DescriptorLayout) -> Self {
        let groups = layout.write_groups().to_vec();
        let pending = groups
            .iter()
            .map(|group| {
                let len = group.descriptor_count() as usize;
                if is_buffer_type(group.descriptor_type) {
                    PendingSlots::Buffers(vec![None; len])
                } else {
                    PendingSlots::Images(vec![None; len])
                }
            })
            .collect();
        Self { set, groups, pending }
    }

    fn locate(&self, binding: u32) -> VulkanResult<(usize, &WriteGroup)> {
        self.groups
            .iter()
            .enumerate()
            .find(|(_, group)| group.contains(binding))
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("Binding {binding} is out of range"),
            })
    }

    /// Queue a buffer for `binding`
    pub fn set_buffer_desc(&mut self, binding: u32, info: vk::DescriptorBufferInfo) -> VulkanResult<()> {
        let (index, group) = self.locate(binding)?;
        let slot = group.slot(binding, 0);
        match &mut self.pending[index] {
            PendingSlots::Buffers(slots) => {
                slots[slot] = Some(info);
                Ok(())
            }
            PendingSlots::Images(_) => Err(VulkanError::InvalidOperation {
                reason: format!("Binding {binding} does not hold buffers"),
            }),
        }
    }

    /// Queue an image for `binding`
    pub fn set_image_desc(&mut self, binding: u32, info: vk::DescriptorImageInfo) -> VulkanResult<()> {
        let (index, group) = self.locate(binding)?;
        let slot = group.slot(binding, 0);
        match &mut self.pending[index] {
            PendingSlots::Images(slots) => {
                slots[slot] = Some(info);
                Ok(())
            }
            PendingSlots::Buffers(_) => Err(VulkanError::InvalidOperation {
                reason: format!("Binding {binding} does not hold images"),
            }),
        }
    }

    /// Writes the next [`Self::update`] will issue; a fully assigned group yields exactly one
    pub fn build_writes(&self) -> Vec<WriteRun> {
        let mut runs = Vec::new();
        for (index, (group, pending)) in self.groups.iter().zip(&self.pending).enumerate() {
            let mut slot = 0;
            while slot < pending.len() {
                if !pending.is_set(slot) {
                    slot += 1;
                    continue;
                }
                let start = slot;
                while slot < pending.len() && pending.is_set(slot) {
                    slot += 1;
                }
                let per_binding = group.descriptors_per_binding as usize;
                runs.push(WriteRun {
                    group: index,
                    dst_binding: group.first_binding + (start / per_binding) as u32,
                    dst_array_element: (start % per_binding) as u32,
                    descriptor_count: (slot - start) as u32,
                    descriptor_type: group.descriptor_type,
                    first_slot: start,
                });
            }
        }
        runs
    }

    /// Flush every queued resource in one `vkUpdateDescriptorSets` call
    pub fn update(&mut self, device: &Device) {
        let runs = self.build_writes();
        if runs.is_empty() {
            return;
        }

        // The infos must stay alive and contiguous until the update call
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::with_capacity(runs.len());
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::with_capacity(runs.len());
        for run in &runs {
            let range = run.first_slot..run.first_slot + run.descriptor_count as usize;
            match &self.pending[run.group] {
                PendingSlots::Buffers(slots) => {
                    buffer_infos.push(slots[range].iter().flatten().copied().collect());
                    image_infos.push(Vec::new());
                }
                PendingSlots::Images(slots) => {
                    image_infos.push(slots[range].iter().flatten().copied().collect());
                    buffer_infos.push(Vec::new());
                }
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = runs
            .iter()
            .enumerate()
            .map(|(i, run)| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(run.dst_binding)
                    .dst_array_element(run.dst_array_element)
                    .descriptor_type(run.descriptor_type);
                if is_buffer_type(run.descriptor_type) {
                    write.buffer_info(&buffer_infos[i]).build()
                } else {
                    write.image_info(&image_infos[i]).build()
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
        self.pending.iter_mut().for_each(PendingSlots::clear);
    }

    /// Set handle
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VS: vk::ShaderStageFlags = vk::ShaderStageFlags::VERTEX;
    const FS: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

    fn buffer_info() -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 64,
        }
    }

    fn image_info() -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
    }

    #[test]
    fn test_consecutive_same_type_bindings_share_a_group() {
        let mut layout = DescriptorLayout::new();
        assert_eq!(layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1), 0);
        assert_eq!(layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1), 1);
        assert_eq!(layout.add(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, FS, 1), 2);
        assert_eq!(layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1), 3);

        let groups = layout.write_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!((groups[0].first_binding, groups[0].binding_count), (0, 2));
        assert_eq!((groups[1].first_binding, groups[1].binding_count), (2, 1));
        assert_eq!((groups[2].first_binding, groups[2].binding_count), (3, 1));
    }

    #[test]
    fn test_stage_mismatch_splits_group() {
        let mut layout = DescriptorLayout::new();
        layout.add(vk::DescriptorType::STORAGE_BUFFER, VS, 1);
        layout.add(vk::DescriptorType::STORAGE_BUFFER, FS, 1);
        assert_eq!(layout.write_groups().len(), 2);
    }

    #[test]
    fn test_write_group_lookup_under_every_add_ordering() {
        let types = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_BUFFER,
        ];
        // Every sequence of four adds over three types
        for code in 0..81u32 {
            let mut layout = DescriptorLayout::new();
            let mut added = Vec::new();
            let mut c = code;
            for _ in 0..4 {
                let ty = types[(c % 3) as usize];
                c /= 3;
                added.push((layout.add(ty, VS, 1), ty));
            }
            for (binding, ty) in added {
                let (_, group) = layout.write_group_for(binding).unwrap();
                assert!(group.contains(binding));
                assert_eq!(group.descriptor_type, ty, "ordering {code}, binding {binding}");
            }
            assert!(layout.write_group_for(4).is_none());
        }
    }

    #[test]
    fn test_pool_sizes_scale_with_instances() {
        let mut layout = DescriptorLayout::new();
        layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1);
        layout.add(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, FS, 2);
        layout.add(vk::DescriptorType::UNIFORM_BUFFER, FS, 1);

        let sizes = layout.pool_sizes(3);
        let ubo = sizes.iter().find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER).unwrap();
        let sampler = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(ubo.descriptor_count, 6);
        assert_eq!(sampler.descriptor_count, 6);
        assert_eq!(sizes.len(), 2);
    }

    #[test]
    fn test_pool_requirements_multiply_by_copies() {
        let node = DescriptorLayout::new().with(vk::DescriptorType::UNIFORM_BUFFER, VS);
        let material = DescriptorLayout::new()
            .with(vk::DescriptorType::UNIFORM_BUFFER, FS)
            .with(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, FS);

        let mut pool = DescriptorPool::new();
        pool.add_descriptor_layout(&node, 4);
        pool.add_descriptor_layout(&material, 2);
        pool.add_descriptor_layout(&material, 0);

        assert_eq!(pool.max_sets(3), 18);
        let sizes = pool.required_sizes(3);
        let ubo = sizes.iter().find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER).unwrap();
        let sampler = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(ubo.descriptor_count, (4 + 2) * 3);
        assert_eq!(sampler.descriptor_count, 2 * 3);
    }

    #[test]
    fn test_fully_assigned_groups_yield_one_write_each() {
        let mut layout = DescriptorLayout::new();
        layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1);
        layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1);
        layout.add(vk::DescriptorType::UNIFORM_BUFFER, VS, 1);
        layout.add(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, FS, 1);

        let mut set = DescriptorSet::new(vk::DescriptorSet::null(), &layout);
        for binding in 0..3 {
            set.set_buffer_desc(binding, buffer_info()).unwrap();
        }
        set.set_image_desc(3, image_info()).unwrap();

        let writes = set.build_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!((writes[0].dst_binding, writes[0].descriptor_count), (0, 3));
        assert_eq!((writes[1].dst_binding, writes[1].descriptor_count), (3, 1));
    }

    #[test]
    fn test_gap_in_group_splits_the_write() {
        let mut layout = DescriptorLayout::new();
        for _ in 0..3 {
            layout.add(vk::DescriptorType::STORAGE_BUFFER, VS, 1);
        }
        let mut set = DescriptorSet::new(vk::DescriptorSet::null(), &layout);
        set.set_buffer_desc(0, buffer_info()).unwrap();
        set.set_buffer_desc(2, buffer_info()).unwrap();

        let writes = set.build_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].dst_binding, 0);
        assert_eq!(writes[1].dst_binding, 2);
    }

    #[test]
    fn test_set_desc_rejects_unknown_binding_and_wrong_kind() {
        let layout = DescriptorLayout::new().with(vk::DescriptorType::UNIFORM_BUFFER, VS);
        let mut set = DescriptorSet::new(vk::DescriptorSet::null(), &layout);
        assert!(set.set_buffer_desc(5, buffer_info()).is_err());
        assert!(set.set_image_desc(0, image_info()).is_err());
        assert!(set.build_writes().is_empty());
    }
}
