//! Hardware ray tracing pipeline for the volume layer pass.
//!
//! Group 0 generates one ray per pixel, group 1 is the (empty) miss shader,
//! and group 2 is a procedural hit group pairing the unit-cube intersection
//! shader with the any-hit shader that integrates each volume and inserts it
//! into the nearest-K layer list.

use crate::error::Result;
use crate::flags::HitGroupType;
use crate::shader_table::{group_handles, ShaderRecord, ShaderTable};
use ash::vk;
use multivol_gpu::{GpuAllocator, GpuError, RayTracingDevice, TraceRaysRegions};

const RAYGEN_STAGE: u32 = 0;
const MISS_STAGE: u32 = 1;
const INTERSECTION_STAGE: u32 = 2;
const ANY_HIT_STAGE: u32 = 3;
const GROUP_COUNT: u32 = 3;

/// Ray tracing pipeline plus its shader tables.
pub struct RayTracingPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    raygen: ShaderTable,
    miss: ShaderTable,
    hit_groups: ShaderTable,
}

impl RayTracingPipeline {
    /// Stages that may access the shared descriptor sets.
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
            | vk::ShaderStageFlags::MISS_KHR.as_raw()
            | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw()
            | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw(),
    );

    /// Create the pipeline and build its shader tables.
    ///
    /// # Safety
    /// - Device, ray tracing loaders, and allocator must be valid.
    /// - `set_layouts` must match the bindings the shaders declare.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let pipeline = match Self::create_pipeline(device, rt, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        match Self::build_tables(device, rt, allocator, pipeline) {
            Ok((raygen, miss, hit_groups)) => {
                tracing::info!("Ray tracing pipeline ready");
                Ok(Self {
                    pipeline,
                    layout,
                    raygen,
                    miss,
                    hit_groups,
                })
            }
            Err(e) => {
                device.destroy_pipeline(pipeline, None);
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    unsafe fn create_pipeline(
        device: &ash::Device,
        rt: &RayTracingDevice,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let sources: [(vk::ShaderStageFlags, &[u32]); 4] = [
            (
                vk::ShaderStageFlags::RAYGEN_KHR,
                multivol_shaders::ray_trace_raygen_shader(),
            ),
            (
                vk::ShaderStageFlags::MISS_KHR,
                multivol_shaders::ray_trace_miss_shader(),
            ),
            (
                vk::ShaderStageFlags::INTERSECTION_KHR,
                multivol_shaders::ray_trace_intersection_shader(),
            ),
            (
                vk::ShaderStageFlags::ANY_HIT_KHR,
                multivol_shaders::ray_trace_any_hit_shader(),
            ),
        ];

        let mut modules = Vec::with_capacity(sources.len());
        for (_, code) in &sources {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            match device.create_shader_module(&info, None) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        device.destroy_shader_module(module, None);
                    }
                    return Err(GpuError::ShaderCompilation(e.to_string()).into());
                }
            }
        }

        let stages: Vec<_> = sources
            .iter()
            .zip(&modules)
            .map(|((stage, _), module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(c"main")
            })
            .collect();

        let groups = [
            general_group(RAYGEN_STAGE),
            general_group(MISS_STAGE),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(HitGroupType::Procedural.to_vk())
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(ANY_HIT_STAGE)
                .intersection_shader(INTERSECTION_STAGE),
        ];

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);

        let result = rt.pipeline.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        );

        for module in modules {
            device.destroy_shader_module(module, None);
        }

        let pipelines = result
            .map_err(|(_, e)| GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}")))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()).into())
    }

    unsafe fn build_tables(
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        pipeline: vk::Pipeline,
    ) -> Result<(ShaderTable, ShaderTable, ShaderTable)> {
        let handles = group_handles(rt, pipeline, GROUP_COUNT)?;
        let caps = &rt.capabilities;
        let record = |group: usize| ShaderRecord::new(&handles[group]);

        let raygen = ShaderTable::new(device, allocator, "raygen_table", &[record(0)], caps)?;
        let miss = match ShaderTable::new(device, allocator, "miss_table", &[record(1)], caps) {
            Ok(table) => table,
            Err(e) => {
                raygen.destroy(allocator)?;
                return Err(e);
            }
        };
        let hit_groups =
            match ShaderTable::new(device, allocator, "hit_group_table", &[record(2)], caps) {
                Ok(table) => table,
                Err(e) => {
                    raygen.destroy(allocator)?;
                    miss.destroy(allocator)?;
                    return Err(e);
                }
            };
        Ok((raygen, miss, hit_groups))
    }

    pub const fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Shader table regions for a trace call.
    pub const fn regions(&self) -> TraceRaysRegions {
        TraceRaysRegions {
            raygen: self.raygen.region(),
            miss: self.miss.region(),
            hit: self.hit_groups.region(),
            callable: vk::StridedDeviceAddressRegionKHR {
                device_address: 0,
                stride: 0,
                size: 0,
            },
        }
    }

    /// Destroy the pipeline and its tables.
    ///
    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        self.raygen.destroy(allocator)?;
        self.miss.destroy(allocator)?;
        self.hit_groups.destroy(allocator)?;
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        Ok(())
    }
}

fn general_group(stage: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(stage)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_groups_reference_one_stage() {
        let group = general_group(MISS_STAGE);
        assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(group.general_shader, MISS_STAGE);
        assert_eq!(group.any_hit_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn stage_mask_covers_every_shader() {
        assert!(RayTracingPipeline::STAGES.contains(vk::ShaderStageFlags::ANY_HIT_KHR));
        assert!(!RayTracingPipeline::STAGES.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
    }
}
