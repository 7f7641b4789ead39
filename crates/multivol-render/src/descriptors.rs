//! Descriptor set layouts and sets of the ray caster.
//!
//! Set 0 holds per-frame data and exists once per frame slot. Set 1 binds
//! everything shared between frames. The volume init sets feed the load and
//! placeholder passes, one per volume source, and the light table exposes the
//! light volume to other renderers.

use ash::vk;
use multivol_core::{FrameRing, FRAME_COUNT};
use multivol_gpu::{merge_pool_sizes, DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
use multivol_raytracing::RayTracingPipeline;

use crate::error::Result;
use crate::resources::{CasterBuffers, CasterImages, Samplers, Texture};

/// Bindings of set 0.
pub mod frame_binding {
    pub const PER_FRAME: u32 = 0;
    pub const PER_OBJECT: u32 = 1;
}

/// Bindings of set 1.
pub mod shared_binding {
    pub const VOLUME_DESCS: u32 = 0;
    pub const VISIBLE_VOLUMES: u32 = 1;
    pub const VISIBLE_COUNT: u32 = 2;
    pub const DISPATCH_ARGS: u32 = 3;
    pub const DRAW_ARGS: u32 = 4;
    pub const VOLUME_VIS: u32 = 5;
    pub const VOLUMES: u32 = 6;
    pub const LIGHT_MAP: u32 = 7;
    pub const LIGHT_MAP_OUT: u32 = 8;
    pub const SCENE_DEPTH: u32 = 9;
    pub const SHADOW_DEPTH: u32 = 10;
    pub const CUBE_MAPS_OUT: u32 = 11;
    pub const CUBE_DEPTHS: u32 = 12;
    pub const CUBE_MAPS: u32 = 13;
    pub const K_DEPTHS: u32 = 14;
    pub const K_COLORS: u32 = 15;
    pub const IRRADIANCE: u32 = 16;
    pub const TLAS: u32 = 17;
}

/// Bindings of the volume init sets.
pub mod volume_init_binding {
    pub const FILE_SOURCE: u32 = 0;
    pub const VOLUME_OUT: u32 = 1;
}

/// A view the caller hands in for sampling, with the layout it will be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledImage {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

impl From<&Texture> for SampledImage {
    fn from(texture: &Texture) -> Self {
        Self {
            view: texture.view,
            layout: texture.layout,
        }
    }
}

/// The light volume as a standalone descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LightTable {
    /// Layout with a single combined image sampler at binding 0.
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

/// Shader stages that see sets 0 and 1.
pub fn shared_stages(ray_tracing: bool) -> vk::ShaderStageFlags {
    let raster = vk::ShaderStageFlags::COMPUTE
        | vk::ShaderStageFlags::VERTEX
        | vk::ShaderStageFlags::FRAGMENT;
    if ray_tracing {
        raster | RayTracingPipeline::STAGES
    } else {
        raster
    }
}

fn frame_layout(stages: vk::ShaderStageFlags) -> DescriptorSetLayoutBuilder {
    DescriptorSetLayoutBuilder::new(stages)
        .uniform_buffer(frame_binding::PER_FRAME)
        .storage_buffer(frame_binding::PER_OBJECT)
}

fn shared_layout(
    stages: vk::ShaderStageFlags,
    num_volume_srcs: u32,
    ray_tracing: bool,
) -> DescriptorSetLayoutBuilder {
    use shared_binding as b;
    let builder = DescriptorSetLayoutBuilder::new(stages)
        .storage_buffer(b::VOLUME_DESCS)
        .storage_buffer(b::VISIBLE_VOLUMES)
        .storage_buffer(b::VISIBLE_COUNT)
        .storage_buffer(b::DISPATCH_ARGS)
        .storage_buffer(b::DRAW_ARGS)
        .storage_buffer(b::VOLUME_VIS)
        .sampled_image_array(b::VOLUMES, num_volume_srcs)
        .sampled_image(b::LIGHT_MAP)
        .storage_image(b::LIGHT_MAP_OUT)
        .sampled_image(b::SCENE_DEPTH)
        .sampled_image(b::SHADOW_DEPTH)
        .storage_image(b::CUBE_MAPS_OUT)
        .storage_image(b::CUBE_DEPTHS)
        .sampled_image(b::CUBE_MAPS)
        .storage_image(b::K_DEPTHS)
        .storage_image(b::K_COLORS)
        .sampled_image(b::IRRADIANCE);
    if ray_tracing {
        builder
            .stages(RayTracingPipeline::STAGES)
            .acceleration_structure(b::TLAS)
    } else {
        builder
    }
}

fn volume_init_layout() -> DescriptorSetLayoutBuilder {
    DescriptorSetLayoutBuilder::new(vk::ShaderStageFlags::COMPUTE)
        .sampled_image(volume_init_binding::FILE_SOURCE)
        .storage_image(volume_init_binding::VOLUME_OUT)
}

fn light_table_layout() -> DescriptorSetLayoutBuilder {
    DescriptorSetLayoutBuilder::new(vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::FRAGMENT)
        .sampled_image(0)
}

/// Every layout, pool, and set of the ray caster.
pub struct CasterDescriptors {
    pub frame_layout: vk::DescriptorSetLayout,
    pub shared_layout: vk::DescriptorSetLayout,
    pub volume_init_layout: vk::DescriptorSetLayout,
    light_table_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    pub frame_sets: FrameRing<vk::DescriptorSet>,
    pub shared_set: vk::DescriptorSet,
    /// One per volume source.
    pub volume_init_sets: Vec<vk::DescriptorSet>,
    light_table_set: vk::DescriptorSet,
}

impl CasterDescriptors {
    /// Create the layouts and allocate every set.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, num_volume_srcs: u32, ray_tracing: bool) -> Result<Self> {
        let stages = shared_stages(ray_tracing);
        let frame = frame_layout(stages);
        let shared = shared_layout(stages, num_volume_srcs, ray_tracing);
        let volume_init = volume_init_layout();
        let light_table = light_table_layout();

        let frame_count = FRAME_COUNT as u32;
        let max_sets = frame_count + num_volume_srcs + 2;
        let pool_sizes = merge_pool_sizes([
            frame.pool_sizes(frame_count),
            shared.pool_sizes(1),
            volume_init.pool_sizes(num_volume_srcs),
            light_table.pool_sizes(1),
        ]);
        let pool = DescriptorPool::new(device, max_sets, &pool_sizes)?;

        let frame_layout = frame.build(device)?;
        let shared_layout = shared.build(device)?;
        let volume_init_layout = volume_init.build(device)?;
        let light_table_layout = light_table.build(device)?;

        let frame_sets = pool.allocate(device, &[frame_layout; FRAME_COUNT])?;
        let frame_sets = FrameRing::from_fn(|i| frame_sets[i]);
        let shared_set = pool.allocate_one(device, shared_layout)?;
        let volume_init_sets =
            pool.allocate(device, &vec![volume_init_layout; num_volume_srcs as usize])?;
        let light_table_set = pool.allocate_one(device, light_table_layout)?;

        tracing::debug!(sets = max_sets, ray_tracing, "allocated ray caster descriptor sets");

        Ok(Self {
            frame_layout,
            shared_layout,
            volume_init_layout,
            light_table_layout,
            pool,
            frame_sets,
            shared_set,
            volume_init_sets,
            light_table_set,
        })
    }

    /// Layouts of sets 0 and 1, in set order.
    pub const fn pass_layouts(&self) -> [vk::DescriptorSetLayout; 2] {
        [self.frame_layout, self.shared_layout]
    }

    pub const fn light_table(&self) -> LightTable {
        LightTable {
            layout: self.light_table_layout,
            set: self.light_table_set,
        }
    }

    /// Point every frame set at its frame slot's buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn write_frames(&self, device: &ash::Device, buffers: &CasterBuffers) {
        for ((set, per_frame), per_object) in self
            .frame_sets
            .iter()
            .zip(buffers.per_frame.iter())
            .zip(buffers.per_object.iter())
        {
            DescriptorWriter::new(*set)
                .uniform_buffer(frame_binding::PER_FRAME, per_frame.buffer, per_frame.size)
                .storage_buffer(frame_binding::PER_OBJECT, per_object.buffer, per_object.size)
                .update(device);
        }
    }

    /// Write every binding of set 1 except the TLAS.
    ///
    /// # Safety
    /// The device must be valid and set 1 must not be in use.
    pub unsafe fn write_shared(
        &self,
        device: &ash::Device,
        buffers: &CasterBuffers,
        images: &CasterImages,
        samplers: &Samplers,
    ) {
        use shared_binding as b;
        let mut writer = DescriptorWriter::new(self.shared_set);
        for (binding, buffer) in [
            (b::VOLUME_DESCS, &buffers.volume_descs),
            (b::VISIBLE_VOLUMES, &buffers.visible),
            (b::VISIBLE_COUNT, &buffers.counter),
            (b::DISPATCH_ARGS, &buffers.dispatch_args),
            (b::DRAW_ARGS, &buffers.draw_args),
            (b::VOLUME_VIS, &buffers.volume_vis),
        ] {
            writer = writer.storage_buffer(binding, buffer.buffer, buffer.size);
        }
        for (element, volume) in images.volumes.iter().enumerate() {
            writer = writer.sampled_image(
                b::VOLUMES,
                element as u32,
                volume.view,
                samplers.linear,
                volume.layout,
            );
        }

        let light = &images.light_map;
        let cube_maps = &images.cube_maps;
        let cube_depths = &images.cube_depths;
        writer
            .sampled_image(b::LIGHT_MAP, 0, light.view, samplers.linear, light.layout)
            .storage_image(b::LIGHT_MAP_OUT, light.view, light.layout)
            .storage_image(b::CUBE_MAPS_OUT, cube_maps.view, cube_maps.layout)
            .sampled_image(b::CUBE_MAPS, 0, cube_maps.view, samplers.linear, cube_maps.layout)
            .storage_image(b::CUBE_DEPTHS, cube_depths.view, cube_depths.layout)
            .update(device);

        self.write_layers(device, images);
        let depth = SampledImage::from(&images.placeholder_depth);
        self.write_depth_maps(device, samplers, depth, depth);
        self.write_irradiance(device, samplers, SampledImage::from(&images.placeholder_irradiance));
    }

    /// Point the layer bindings at the current K-buffer images.
    ///
    /// # Safety
    /// The device must be valid and set 1 must not be in use.
    pub unsafe fn write_layers(&self, device: &ash::Device, images: &CasterImages) {
        let (depths, colors) = (&images.k_depths, &images.k_colors);
        DescriptorWriter::new(self.shared_set)
            .storage_image(shared_binding::K_DEPTHS, depths.view, depths.layout)
            .storage_image(shared_binding::K_COLORS, colors.view, colors.layout)
            .update(device);
    }

    /// # Safety
    /// The device and views must be valid and set 1 must not be in use.
    pub unsafe fn write_depth_maps(
        &self,
        device: &ash::Device,
        samplers: &Samplers,
        scene: SampledImage,
        shadow: SampledImage,
    ) {
        DescriptorWriter::new(self.shared_set)
            .sampled_image(shared_binding::SCENE_DEPTH, 0, scene.view, samplers.nearest, scene.layout)
            .sampled_image(shared_binding::SHADOW_DEPTH, 0, shadow.view, samplers.nearest, shadow.layout)
            .update(device);
    }

    /// # Safety
    /// The device and view must be valid and set 1 must not be in use.
    pub unsafe fn write_irradiance(&self, device: &ash::Device, samplers: &Samplers, irradiance: SampledImage) {
        DescriptorWriter::new(self.shared_set)
            .sampled_image(
                shared_binding::IRRADIANCE,
                0,
                irradiance.view,
                samplers.linear,
                irradiance.layout,
            )
            .update(device);
    }

    /// # Safety
    /// The device must be valid and the layout must have been created with ray tracing.
    pub unsafe fn write_tlas(&self, device: &ash::Device, tlas: vk::AccelerationStructureKHR) {
        DescriptorWriter::new(self.shared_set)
            .acceleration_structure(shared_binding::TLAS, tlas)
            .update(device);
    }

    /// Point a volume init set at its source and target.
    ///
    /// # Safety
    /// The device and views must be valid and the set must not be in use.
    pub unsafe fn write_volume_init(
        &self,
        device: &ash::Device,
        samplers: &Samplers,
        slot: usize,
        source: SampledImage,
        target: SampledImage,
    ) {
        DescriptorWriter::new(self.volume_init_sets[slot])
            .sampled_image(
                volume_init_binding::FILE_SOURCE,
                0,
                source.view,
                samplers.linear,
                source.layout,
            )
            .storage_image(volume_init_binding::VOLUME_OUT, target.view, target.layout)
            .update(device);
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn write_light_table(&self, device: &ash::Device, images: &CasterImages, samplers: &Samplers) {
        let light = &images.light_map;
        DescriptorWriter::new(self.light_table_set)
            .sampled_image(0, 0, light.view, samplers.linear, light.layout)
            .update(device);
    }

    /// # Safety
    /// No set may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pool.destroy(device);
        for layout in [
            self.frame_layout,
            self.shared_layout,
            self.volume_init_layout,
            self.light_table_layout,
        ] {
            device.destroy_descriptor_set_layout(layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(sizes: &[vk::DescriptorPoolSize], ty: vk::DescriptorType) -> u32 {
        sizes
            .iter()
            .filter(|s| s.ty == ty)
            .map(|s| s.descriptor_count)
            .sum()
    }

    #[test]
    fn shared_set_counts() {
        let sizes = shared_layout(shared_stages(false), 3, false).pool_sizes(1);
        assert_eq!(count(&sizes, vk::DescriptorType::STORAGE_BUFFER), 6);
        // Volume array plus light, two depths, cube maps, irradiance.
        assert_eq!(count(&sizes, vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 3 + 5);
        assert_eq!(count(&sizes, vk::DescriptorType::STORAGE_IMAGE), 5);
        assert_eq!(count(&sizes, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 0);
    }

    #[test]
    fn tlas_binding_only_with_ray_tracing() {
        let sizes = shared_layout(shared_stages(true), 1, true).pool_sizes(1);
        assert_eq!(count(&sizes, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 1);
        assert!(shared_stages(true).contains(vk::ShaderStageFlags::ANY_HIT_KHR));
        assert!(!shared_stages(false).contains(vk::ShaderStageFlags::RAYGEN_KHR));
    }

    #[test]
    fn frame_sets_cover_every_slot() {
        let sizes = frame_layout(shared_stages(false)).pool_sizes(FRAME_COUNT as u32);
        assert_eq!(count(&sizes, vk::DescriptorType::UNIFORM_BUFFER), FRAME_COUNT as u32);
        assert_eq!(count(&sizes, vk::DescriptorType::STORAGE_BUFFER), FRAME_COUNT as u32);
    }
}
