//! Command buffer management.

use crate::context::RayTracingDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers[0])
    }

    /// Allocate multiple command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers)
    }

    /// Reset the command pool.
    ///
    /// # Safety
    /// The device must be valid and all command buffers from this pool must not be in use.
    pub unsafe fn reset(
        &self,
        device: &ash::Device,
        flags: vk::CommandPoolResetFlags,
    ) -> Result<()> {
        device.reset_command_pool(self.pool, flags)?;
        Ok(())
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue, signaling `fence` on completion.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// A pipeline stage and the memory accesses it performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Access {
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    pub const COMPUTE_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
    );
    pub const COMPUTE_READ: Self = Self::new(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_READ,
    );
    pub const FRAGMENT_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
    );
    pub const FRAGMENT_READ: Self = Self::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_READ,
    );
    pub const TRANSFER_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
    );
    pub const TRANSFER_READ: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
    );
    pub const INDIRECT_READ: Self = Self::new(
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::AccessFlags2::INDIRECT_COMMAND_READ,
    );
    pub const RAY_TRACING_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
    );
    pub const RAY_TRACING_READ: Self = Self::new(
        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        vk::AccessFlags2::SHADER_READ,
    );
    pub const AS_BUILD_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    );
    pub const AS_BUILD_READ: Self = Self::new(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    );
    pub const COLOR_WRITE: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    );

    /// Union of two accesses.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self {
            stage: vk::PipelineStageFlags2::from_raw(self.stage.as_raw() | other.stage.as_raw()),
            access: vk::AccessFlags2::from_raw(self.access.as_raw() | other.access.as_raw()),
        }
    }
}

/// An image layout transition with its access scopes.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src: Access,
    pub dst: Access,
    pub range: vk::ImageSubresourceRange,
}

/// A single color attachment for a dynamic rendering pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorTarget {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

/// A dynamic rendering pass; viewport and scissor cover `extent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderingDesc {
    pub extent: vk::Extent2D,
    /// `None` for attachment-less passes.
    pub color: Option<ColorTarget>,
}

/// Shader table regions for a ray dispatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceRaysRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Narrow command-list capability used by every render pass.
///
/// [`VulkanRecorder`] is the one real implementation; tests substitute a
/// recorder that captures the command stream.
pub trait CommandRecorder {
    /// Global memory dependency.
    fn memory_barrier(&mut self, src: Access, dst: Access);
    /// Image layout transition and memory dependency.
    fn image_barrier(&mut self, barrier: &ImageBarrier);
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: vk::ClearColorValue,
        range: vk::ImageSubresourceRange,
    );
    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: u64);
    fn begin_rendering(&mut self, desc: &RenderingDesc);
    fn end_rendering(&mut self);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType);
    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    fn draw_indexed_indirect(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );
    /// Build or update acceleration structures. Fails without ray tracing support.
    fn build_acceleration_structures(
        &mut self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()>;
    /// Dispatch rays. Fails without ray tracing support.
    fn trace_rays(
        &mut self,
        regions: &TraceRaysRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()>;
}

/// [`CommandRecorder`] writing into a Vulkan command buffer.
pub struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    ray_tracing: Option<&'a RayTracingDevice>,
    cmd: vk::CommandBuffer,
}

impl<'a> VulkanRecorder<'a> {
    /// Wrap a command buffer in the recording state.
    ///
    /// # Safety
    /// `cmd` must be a command buffer of `device` in the recording state for
    /// the lifetime of the recorder.
    pub unsafe fn new(
        device: &'a ash::Device,
        ray_tracing: Option<&'a RayTracingDevice>,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            ray_tracing,
            cmd,
        }
    }

    /// The wrapped command buffer.
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn ray_tracing(&self) -> Result<&'a RayTracingDevice> {
        self.ray_tracing.ok_or_else(|| {
            GpuError::ExtensionNotSupported(
                ash::khr::ray_tracing_pipeline::NAME.to_string_lossy().into_owned(),
            )
        })
    }
}

impl CommandRecorder for VulkanRecorder<'_> {
    fn memory_barrier(&mut self, src: Access, dst: Access) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access);
        let info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &info) };
    }

    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(barrier.src.stage)
            .src_access_mask(barrier.src.access)
            .dst_stage_mask(barrier.dst.stage)
            .dst_access_mask(barrier.dst.access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.range);
        let info = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&image_barrier));
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &info) };
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) };
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.cmd, src, dst, layout, regions);
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(self.cmd, src, layout, dst, regions);
        }
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: vk::ClearColorValue,
        range: vk::ImageSubresourceRange,
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(self.cmd, image, layout, &value, &[range]);
        }
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline) };
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, &[]);
        }
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.cmd, layout, stages, offset, data);
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) };
    }

    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: u64) {
        unsafe { self.device.cmd_dispatch_indirect(self.cmd, buffer, offset) };
    }

    fn begin_rendering(&mut self, desc: &RenderingDesc) {
        let attachments: Vec<vk::RenderingAttachmentInfo<'_>> = desc
            .color
            .iter()
            .map(|target| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(target.layout)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
            })
            .collect();
        let area = vk::Rect2D::default().extent(desc.extent);
        let info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&attachments);

        let viewport = vk::Viewport::default()
            .width(desc.extent.width as f32)
            .height(desc.extent.height as f32)
            .max_depth(1.0);

        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &info);
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[area]);
        }
    }

    fn end_rendering(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.cmd) };
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(self.cmd, vertex_count, instance_count, 0, 0) };
    }

    fn draw_indexed_indirect(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(self.cmd, buffer, offset, draw_count, stride);
        }
    }

    fn build_acceleration_structures(
        &mut self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()> {
        let rt = self.ray_tracing()?;
        unsafe {
            rt.acceleration_structure
                .cmd_build_acceleration_structures(self.cmd, infos, ranges);
        }
        Ok(())
    }

    fn trace_rays(
        &mut self,
        regions: &TraceRaysRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let rt = self.ray_tracing()?;
        unsafe {
            rt.pipeline.cmd_trace_rays(
                self.cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                width,
                height,
                depth,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_union_merges_stages_and_flags() {
        let both = Access::COMPUTE_WRITE.and(Access::INDIRECT_READ);
        assert!(both.stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert!(both.stage.contains(vk::PipelineStageFlags2::DRAW_INDIRECT));
        assert!(both.access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
        assert!(both.access.contains(vk::AccessFlags2::INDIRECT_COMMAND_READ));
    }
}
