//! Descriptor set layouts, pools, and batched set updates.

use crate::error::{GpuError, Result};
use ash::vk;

/// Descriptor set layout builder.
///
/// Bindings added through the typed helpers use the builder's current
/// stages; [`Self::stages`] changes them for the bindings that follow.
pub struct DescriptorSetLayoutBuilder {
    stages: vk::ShaderStageFlags,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub const fn new(stages: vk::ShaderStageFlags) -> Self {
        Self {
            stages,
            bindings: Vec::new(),
        }
    }

    /// Stages for subsequently added bindings.
    pub const fn stages(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.stages = stages;
        self
    }

    fn push(mut self, binding: u32, ty: vk::DescriptorType, count: u32) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(self.stages),
        );
        self
    }

    pub fn uniform_buffer(self, binding: u32) -> Self {
        self.push(binding, vk::DescriptorType::UNIFORM_BUFFER, 1)
    }

    pub fn storage_buffer(self, binding: u32) -> Self {
        self.push(binding, vk::DescriptorType::STORAGE_BUFFER, 1)
    }

    pub fn storage_image(self, binding: u32) -> Self {
        self.push(binding, vk::DescriptorType::STORAGE_IMAGE, 1)
    }

    /// A combined image sampler.
    pub fn sampled_image(self, binding: u32) -> Self {
        self.sampled_image_array(binding, 1)
    }

    pub fn sampled_image_array(self, binding: u32, count: u32) -> Self {
        self.push(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count)
    }

    pub fn acceleration_structure(self, binding: u32) -> Self {
        self.push(binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1)
    }

    /// Descriptor counts per type, for a pool holding `sets` copies of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        merge_pool_sizes([self.bindings.iter().map(|binding| {
            vk::DescriptorPoolSize::default()
                .ty(binding.descriptor_type)
                .descriptor_count(binding.descriptor_count * sets)
        })])
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        Ok(device.create_descriptor_set_layout(&info, None)?)
    }
}

/// Sum pool sizes of several layouts, one entry per descriptor type.
pub fn merge_pool_sizes<G>(groups: impl IntoIterator<Item = G>) -> Vec<vk::DescriptorPoolSize>
where
    G: IntoIterator<Item = vk::DescriptorPoolSize>,
{
    let mut merged: Vec<vk::DescriptorPoolSize> = Vec::new();
    for size in groups.into_iter().flatten() {
        match merged.iter_mut().find(|m| m.ty == size.ty) {
            Some(m) => m.descriptor_count += size.descriptor_count,
            None => merged.push(size),
        }
    }
    merged
}

/// Fixed-size descriptor pool. Sets live until the pool is destroyed.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let pool = device.create_descriptor_pool(&info, None)?;
        Ok(Self { pool })
    }

    /// Allocate one set per layout, in order.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);
        Ok(device.allocate_descriptor_sets(&info)?)
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_one(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.allocate(device, &[layout])?
            .first()
            .copied()
            .ok_or_else(|| GpuError::AllocationFailed("empty descriptor set allocation".to_string()))
    }

    /// # Safety
    /// No set from this pool may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

#[derive(Clone, Copy, Debug)]
enum Entry {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    },
    AccelerationStructure {
        binding: u32,
        handle: vk::AccelerationStructureKHR,
    },
}

impl Entry {
    const fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Buffer { ty, .. } | Self::Image { ty, .. } => *ty,
            Self::AccelerationStructure { .. } => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Writes to one descriptor set, applied in a single update.
#[must_use = "writes are only applied by `update`"]
pub struct DescriptorWriter {
    set: vk::DescriptorSet,
    entries: Vec<Entry>,
}

impl DescriptorWriter {
    pub const fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            entries: Vec::new(),
        }
    }

    fn buffer(mut self, binding: u32, ty: vk::DescriptorType, buffer: vk::Buffer, range: u64) -> Self {
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(range);
        self.entries.push(Entry::Buffer { binding, ty, info });
        self
    }

    /// Bind `range` bytes from the start of `buffer`.
    pub fn uniform_buffer(self, binding: u32, buffer: vk::Buffer, range: u64) -> Self {
        self.buffer(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer, range)
    }

    /// Bind `range` bytes from the start of `buffer`.
    pub fn storage_buffer(self, binding: u32, buffer: vk::Buffer, range: u64) -> Self {
        self.buffer(binding, vk::DescriptorType::STORAGE_BUFFER, buffer, range)
    }

    pub fn storage_image(mut self, binding: u32, view: vk::ImageView, layout: vk::ImageLayout) -> Self {
        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(layout);
        self.entries.push(Entry::Image {
            binding,
            element: 0,
            ty: vk::DescriptorType::STORAGE_IMAGE,
            info,
        });
        self
    }

    /// Combined image sampler at array element `element` of `binding`.
    pub fn sampled_image(
        mut self,
        binding: u32,
        element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Self {
        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(layout);
        self.entries.push(Entry::Image {
            binding,
            element,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info,
        });
        self
    }

    pub fn acceleration_structure(mut self, binding: u32, handle: vk::AccelerationStructureKHR) -> Self {
        self.entries
            .push(Entry::AccelerationStructure { binding, handle });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every queued write.
    ///
    /// # Safety
    /// The device, set, and every referenced handle must be valid, and the
    /// set must not be in use by pending commands.
    pub unsafe fn update(self, device: &ash::Device) {
        let handles: Vec<[vk::AccelerationStructureKHR; 1]> = self
            .entries
            .iter()
            .filter_map(|entry| match entry {
                Entry::AccelerationStructure { handle, .. } => Some([*handle]),
                _ => None,
            })
            .collect();
        let mut structures: Vec<_> = handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(handle)
            })
            .collect();
        let mut structures = structures.iter_mut();

        let mut writes = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .descriptor_type(entry.descriptor_type());
            let write = match entry {
                Entry::Buffer { binding, info, .. } => write
                    .dst_binding(*binding)
                    .buffer_info(std::slice::from_ref(info)),
                Entry::Image {
                    binding,
                    element,
                    info,
                    ..
                } => write
                    .dst_binding(*binding)
                    .dst_array_element(*element)
                    .image_info(std::slice::from_ref(info)),
                Entry::AccelerationStructure { binding, .. } => {
                    let Some(next) = structures.next() else { continue };
                    let mut write = write.dst_binding(*binding).push_next(next);
                    write.descriptor_count = 1;
                    write
                }
            };
            writes.push(write);
        }

        device.update_descriptor_sets(&writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_aggregate_by_type() {
        let builder = DescriptorSetLayoutBuilder::new(vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(0)
            .storage_buffer(1)
            .storage_buffer(2)
            .sampled_image_array(3, 5);

        let sizes = builder.pool_sizes(3);
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map_or(0, |s| s.descriptor_count)
        };
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), 3);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), 6);
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 15);
        assert_eq!(sizes.len(), 3);
    }

    #[test]
    fn stages_apply_to_later_bindings() {
        let builder = DescriptorSetLayoutBuilder::new(vk::ShaderStageFlags::FRAGMENT)
            .storage_image(0)
            .stages(vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(1);
        assert_eq!(builder.bindings[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(builder.bindings[1].stage_flags, vk::ShaderStageFlags::RAYGEN_KHR);
    }

    #[test]
    fn merged_pool_sizes_sum_counts() {
        let a = vec![vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(2)];
        let b = vec![
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(3),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
        ];
        let merged = merge_pool_sizes([a, b]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].descriptor_count, 5);
    }

    #[test]
    fn writer_queues_typed_entries() {
        let writer = DescriptorWriter::new(vk::DescriptorSet::null())
            .uniform_buffer(0, vk::Buffer::null(), 64)
            .sampled_image(
                3,
                2,
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .acceleration_structure(5, vk::AccelerationStructureKHR::null());
        assert_eq!(writer.len(), 3);
        let types: Vec<_> = writer.entries.iter().map(Entry::descriptor_type).collect();
        assert_eq!(
            types,
            [
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            ]
        );
        assert!(matches!(writer.entries[1], Entry::Image { element: 2, .. }));
    }
}
