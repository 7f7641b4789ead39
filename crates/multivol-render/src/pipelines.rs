//! Compute and graphics pipelines of the ray caster.

use ash::vk;
use multivol_gpu::{BlendMode, ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig};

use crate::error::Result;
use crate::gpu_types::PUSH_CONSTANT_SIZE;

fn push_range(stages: vk::ShaderStageFlags) -> vk::PushConstantRange {
    vk::PushConstantRange::default()
        .stage_flags(stages)
        .offset(0)
        .size(PUSH_CONSTANT_SIZE)
}

/// Config for the cube proxy passes, which write storage images only.
fn cube_config(fragment_shader: &[u32]) -> GraphicsPipelineConfig {
    GraphicsPipelineConfig {
        vertex_shader: multivol_shaders::cube_vertex_shader().to_vec(),
        fragment_shader: fragment_shader.to_vec(),
        ..GraphicsPipelineConfig::default()
    }
}

/// Config for the resolve pass blending into the caller's target.
fn resolve_config(target_format: vk::Format) -> GraphicsPipelineConfig {
    GraphicsPipelineConfig {
        vertex_shader: multivol_shaders::fullscreen_vertex_shader().to_vec(),
        fragment_shader: multivol_shaders::resolve_oit_shader().to_vec(),
        color_formats: vec![target_format],
        blend: BlendMode::PremultipliedOver,
        ..GraphicsPipelineConfig::default()
    }
}

/// Every pipeline the caster records.
pub struct CasterPipelines {
    pub cull: ComputePipeline,
    pub march_l: ComputePipeline,
    pub march_v: ComputePipeline,
    /// Resamples a loaded file into a volume texture.
    pub load: ComputePipeline,
    /// Fills a volume texture with a procedural placeholder.
    pub init: ComputePipeline,
    pub peel: GraphicsPipeline,
    pub render_cube: GraphicsPipeline,
    pub resolve: GraphicsPipeline,
}

impl CasterPipelines {
    /// Create every pipeline.
    ///
    /// `pass_layouts` are sets 0 and 1; `volume_init_layout` feeds the load
    /// and placeholder passes.
    ///
    /// # Safety
    /// The device must be valid and the layouts must match the shaders.
    pub unsafe fn new(
        device: &ash::Device,
        pass_layouts: &[vk::DescriptorSetLayout],
        volume_init_layout: vk::DescriptorSetLayout,
        target_format: vk::Format,
    ) -> Result<Self> {
        let compute_push = [push_range(vk::ShaderStageFlags::COMPUTE)];
        let fragment_push = [push_range(vk::ShaderStageFlags::FRAGMENT)];

        let cull = ComputePipeline::new(device, multivol_shaders::volume_cull_shader(), pass_layouts, &[])?;
        let march_l =
            ComputePipeline::new(device, multivol_shaders::ray_march_l_shader(), pass_layouts, &[])?;
        let march_v =
            ComputePipeline::new(device, multivol_shaders::ray_march_v_shader(), pass_layouts, &[])?;
        let load = ComputePipeline::new(
            device,
            multivol_shaders::load_volume_data_shader(),
            &[volume_init_layout],
            &compute_push,
        )?;
        let init = ComputePipeline::new(
            device,
            multivol_shaders::init_volume_data_shader(),
            &[volume_init_layout],
            &compute_push,
        )?;

        let peel = GraphicsPipeline::new(
            device,
            &cube_config(multivol_shaders::cube_depth_peel_shader()),
            pass_layouts,
            &fragment_push,
        )?;
        let render_cube = GraphicsPipeline::new(
            device,
            &cube_config(multivol_shaders::render_cube_shader()),
            pass_layouts,
            &[],
        )?;
        let resolve = GraphicsPipeline::new(device, &resolve_config(target_format), pass_layouts, &[])?;

        tracing::debug!(?target_format, "created ray caster pipelines");

        Ok(Self {
            cull,
            march_l,
            march_v,
            load,
            init,
            peel,
            render_cube,
            resolve,
        })
    }

    /// # Safety
    /// No pipeline may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for compute in [&self.cull, &self.march_l, &self.march_v, &self.load, &self.init] {
            compute.destroy(device);
        }
        for graphics in [&self.peel, &self.render_cube, &self.resolve] {
            graphics.destroy(device);
        }
    }
}
