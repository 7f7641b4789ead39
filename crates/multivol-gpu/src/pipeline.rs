//! Compute and dynamic-rendering graphics pipelines.
//!
//! Every graphics pass of the ray caster draws procedural geometry (a cube
//! or a fullscreen triangle generated from `gl_VertexIndex`) without vertex
//! buffers or depth attachments, so the graphics config only exposes what
//! those passes vary.

use crate::error::{GpuError, Result};
use ash::vk;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Shader module destroyed when dropped out of scope.
struct Module<'a> {
    device: &'a ash::Device,
    handle: vk::ShaderModule,
}

impl<'a> Module<'a> {
    unsafe fn new(device: &'a ash::Device, code: &[u32], stage: &str) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let handle = device
            .create_shader_module(&info, None)
            .map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))?;
        Ok(Self { device, handle })
    }

    fn stage(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.handle)
            .name(ENTRY_POINT)
    }
}

impl Drop for Module<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

unsafe fn create_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    device
        .create_pipeline_layout(&info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Take the single pipeline out of a create call, releasing `layout` on
/// failure.
unsafe fn single_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    result: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
) -> Result<vk::Pipeline> {
    match result {
        Ok(pipelines) => pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string())),
        Err((_, e)) => {
            device.destroy_pipeline_layout(layout, None);
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        shader_code: &[u32],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let module = Module::new(device, shader_code, "compute")?;
        let layout = create_layout(device, descriptor_set_layouts, push_constant_ranges)?;

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(module.stage(vk::ShaderStageFlags::COMPUTE))
            .layout(layout);
        let result = device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None);
        let pipeline = single_pipeline(device, layout, result)?;

        Ok(Self { pipeline, layout })
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Color attachment blending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendMode {
    /// Overwrite the attachment.
    #[default]
    Opaque,
    /// Premultiplied "over": `dst = src + (1 - src.a) * dst`.
    PremultipliedOver,
}

impl BlendMode {
    fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            Self::Opaque => state.blend_enable(false),
            Self::PremultipliedOver => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// Graphics pipeline configuration.
///
/// An empty `color_formats` list describes an attachment-less pass whose
/// fragment shader only writes storage images.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub color_formats: Vec<vk::Format>,
    pub blend: BlendMode,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            color_formats: Vec::new(),
            blend: BlendMode::Opaque,
        }
    }
}

impl GraphicsPipelineConfig {
    fn blend_attachments(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        vec![self.blend.attachment_state(); self.color_formats.len()]
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline for dynamic rendering (Vulkan 1.3) with
    /// dynamic viewport and scissor.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let vertex = Module::new(device, &config.vertex_shader, "vertex")?;
        let fragment = Module::new(device, &config.fragment_shader, "fragment")?;
        let stages = [
            vertex.stage(vk::ShaderStageFlags::VERTEX),
            fragment.stage(vk::ShaderStageFlags::FRAGMENT),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(config.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();

        let attachments = config.blend_attachments();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout = create_layout(device, descriptor_set_layouts, push_constant_ranges)?;

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);
        let result = device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None);
        let pipeline = single_pipeline(device, layout, result)?;

        Ok(Self { pipeline, layout })
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premultiplied_over_blends_source_alpha() {
        let state = BlendMode::PremultipliedOver.attachment_state();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(
            state.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }

    #[test]
    fn opaque_disables_blending() {
        let state = BlendMode::default().attachment_state();
        assert_eq!(state.blend_enable, vk::FALSE);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn attachment_less_pass_has_no_blend_state() {
        let config = GraphicsPipelineConfig::default();
        assert!(config.blend_attachments().is_empty());

        let resolve = GraphicsPipelineConfig {
            color_formats: vec![vk::Format::B8G8R8A8_UNORM],
            blend: BlendMode::PremultipliedOver,
            ..GraphicsPipelineConfig::default()
        };
        let attachments = resolve.blend_attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].blend_enable, vk::TRUE);
    }
}
