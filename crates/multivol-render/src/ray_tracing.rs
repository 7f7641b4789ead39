//! Acceleration structures and the ray tracing pipeline of the OIT pass.
//!
//! Every volume instances the same procedural BLAS over the proxy bounds, so
//! moving a volume only touches the TLAS.

use ash::vk;
use glam::Mat4;
use multivol_core::{Aabb, FrameIndex};
use multivol_gpu::{Access, CommandRecorder, GpuAllocator, RayTracingDevice, TraceRaysRegions};
use multivol_raytracing::{
    AccelerationScratch, BlasIndex, BottomLevelAs, BuildFlags, GeometryFlags, InstanceDesc,
    RayTracingPipeline, TopLevelAs,
};

use crate::error::Result;

/// Slot of the shared proxy in the BLAS table.
pub const PROXY_BLAS: BlasIndex = BlasIndex(0);

/// One TLAS instance per volume, all referencing the proxy BLAS.
pub fn volume_instances(worlds: &[Mat4]) -> Vec<InstanceDesc> {
    worlds
        .iter()
        .enumerate()
        .map(|(i, &world)| InstanceDesc::volume(i as u32, world, PROXY_BLAS))
        .collect()
}

/// Orders a build after earlier builds and traces that touched the same memory.
fn build_barrier<R: CommandRecorder + ?Sized>(recorder: &mut R) {
    let as_read = Access::new(
        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    );
    recorder.memory_barrier(
        Access::AS_BUILD_WRITE.and(as_read),
        Access::AS_BUILD_WRITE.and(Access::AS_BUILD_READ),
    );
}

/// BLAS table, TLAS, shared scratch, and the ray tracing pipeline.
pub struct VolumeAccel {
    blas_table: Vec<BottomLevelAs>,
    tlas: TopLevelAs,
    scratch: AccelerationScratch,
    pipeline: RayTracingPipeline,
    blas_built: bool,
    /// Scene generation the TLAS was last built for.
    tlas_generation: Option<u64>,
}

impl VolumeAccel {
    /// Create every ray tracing object for `num_volumes` instances of `proxy`.
    ///
    /// # Safety
    /// Device, ray tracing loaders, and allocator must be valid, and
    /// `set_layouts` must match the ray tracing shaders.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        proxy: Aabb,
        num_volumes: u32,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let blas = BottomLevelAs::new(
            device,
            rt,
            allocator,
            &[proxy],
            BuildFlags::PREFER_FAST_TRACE,
            GeometryFlags::NO_DUPLICATE_ANY_HIT,
        )?;
        let tlas = TopLevelAs::new(
            device,
            rt,
            allocator,
            num_volumes,
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE,
        )?;

        let scratch_size = blas
            .prebuild_info()
            .scratch_size
            .max(tlas.prebuild_info().max_scratch_size());
        let scratch = AccelerationScratch::new(
            device,
            allocator,
            scratch_size,
            rt.capabilities.min_scratch_offset_alignment,
        )?;
        let pipeline = RayTracingPipeline::new(device, rt, allocator, set_layouts)?;

        tracing::info!(num_volumes, scratch_size, "created volume acceleration structures");

        Ok(Self {
            blas_table: vec![blas],
            tlas,
            scratch,
            pipeline,
            blas_built: false,
            tlas_generation: None,
        })
    }

    pub const fn tlas_handle(&self) -> vk::AccelerationStructureKHR {
        self.tlas.handle()
    }

    pub const fn pipeline(&self) -> vk::Pipeline {
        self.pipeline.pipeline()
    }

    pub const fn layout(&self) -> vk::PipelineLayout {
        self.pipeline.layout()
    }

    pub const fn regions(&self) -> TraceRaysRegions {
        self.pipeline.regions()
    }

    /// Record the BLAS build once and a TLAS build or refit when the scene
    /// generation moved. Returns whether anything was recorded.
    ///
    /// # Safety
    /// The recorder must target a command buffer of `device`.
    pub unsafe fn record_builds<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &mut R,
        device: &ash::Device,
        frame: FrameIndex,
        worlds: &[Mat4],
        generation: u64,
    ) -> Result<bool> {
        let mut recorded = false;
        if !self.blas_built {
            for blas in &self.blas_table {
                build_barrier(recorder);
                blas.record_build(recorder, device, self.scratch.address())?;
            }
            self.blas_built = true;
            recorded = true;
        }

        let changed = self.tlas_generation != Some(generation);
        if let Some(mode) = self.tlas.plan(changed) {
            let addresses: Vec<vk::DeviceAddress> =
                self.blas_table.iter().map(BottomLevelAs::device_address).collect();
            self.tlas
                .write_instances(frame, &volume_instances(worlds), &addresses)?;
            build_barrier(recorder);
            self.tlas
                .record_build(recorder, device, frame, self.scratch.address(), mode)?;
            self.tlas_generation = Some(generation);
            recorded = true;
        }
        Ok(recorded)
    }

    /// # Safety
    /// No structure or pipeline may be in use.
    pub unsafe fn destroy(
        self,
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        self.pipeline.destroy(device, allocator)?;
        self.tlas.destroy(rt, allocator)?;
        for blas in self.blas_table {
            blas.destroy(rt, allocator)?;
        }
        self.scratch.destroy(allocator)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use multivol_core::math::cube_world;
    use multivol_raytracing::InstanceFlags;

    #[test]
    fn every_volume_instances_the_proxy() {
        let worlds = [
            cube_world(2.0, Vec3::ZERO),
            cube_world(1.0, Vec3::new(3.0, 0.0, 0.0)),
        ];
        let instances = volume_instances(&worlds);
        assert_eq!(instances.len(), 2);
        for (i, instance) in instances.iter().enumerate() {
            assert_eq!(instance.instance_id, i as u32);
            assert_eq!(instance.blas, PROXY_BLAS);
            assert!(instance.flags.contains(InstanceFlags::FORCE_NON_OPAQUE));
        }
        assert_eq!(instances[1].transform, worlds[1]);
    }
}
