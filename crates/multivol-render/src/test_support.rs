//! A [`CommandRecorder`] that logs commands instead of recording them.

use ash::vk;
use multivol_gpu::{Access, CommandRecorder, GpuError, ImageBarrier, RenderingDesc, TraceRaysRegions};

#[derive(Clone, Debug)]
pub enum Command {
    MemoryBarrier { src: Access, dst: Access },
    ImageBarrier(ImageBarrier),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, src_offset: u64, size: u64 },
    CopyBufferToImage { dst: vk::Image },
    CopyImageToBuffer { src: vk::Image, dst: vk::Buffer },
    ClearColorImage { image: vk::Image },
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindDescriptorSets { bind_point: vk::PipelineBindPoint, sets: Vec<vk::DescriptorSet> },
    PushConstants { stages: vk::ShaderStageFlags, data: Vec<u8> },
    Dispatch(u32, u32, u32),
    DispatchIndirect(vk::Buffer),
    BeginRendering(RenderingDesc),
    EndRendering,
    BindIndexBuffer(vk::Buffer),
    Draw { vertex_count: u32, instance_count: u32 },
    DrawIndexedIndirect { buffer: vk::Buffer, stride: u32 },
    BuildAccelerationStructures(usize),
    TraceRays(u32, u32, u32),
}

#[derive(Default)]
pub struct CommandLog {
    pub commands: Vec<Command>,
    /// Whether acceleration structure builds and ray dispatches succeed.
    pub ray_tracing: bool,
}

impl CommandLog {
    pub fn with_ray_tracing() -> Self {
        Self {
            ray_tracing: true,
            ..Self::default()
        }
    }

    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }

    pub fn position(&self, pred: impl Fn(&Command) -> bool) -> Option<usize> {
        self.commands.iter().position(pred)
    }

    fn require_ray_tracing(&self) -> multivol_gpu::Result<()> {
        if self.ray_tracing {
            Ok(())
        } else {
            Err(GpuError::ExtensionNotSupported("VK_KHR_ray_tracing_pipeline".to_string()))
        }
    }
}

impl CommandRecorder for CommandLog {
    fn memory_barrier(&mut self, src: Access, dst: Access) {
        self.commands.push(Command::MemoryBarrier { src, dst });
    }

    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        self.commands.push(Command::ImageBarrier(*barrier));
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        for region in regions {
            self.commands.push(Command::CopyBuffer {
                src,
                dst,
                src_offset: region.src_offset,
                size: region.size,
            });
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        _src: vk::Buffer,
        dst: vk::Image,
        _layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(Command::CopyBufferToImage { dst });
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        _layout: vk::ImageLayout,
        dst: vk::Buffer,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(Command::CopyImageToBuffer { src, dst });
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        _layout: vk::ImageLayout,
        _value: vk::ClearColorValue,
        _range: vk::ImageSubresourceRange,
    ) {
        self.commands.push(Command::ClearColorImage { image });
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.commands.push(Command::BindPipeline(bind_point, pipeline));
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.commands.push(Command::BindDescriptorSets {
            bind_point,
            sets: sets.to_vec(),
        });
    }

    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.commands.push(Command::PushConstants {
            stages,
            data: data.to_vec(),
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch(x, y, z));
    }

    fn dispatch_indirect(&mut self, buffer: vk::Buffer, _offset: u64) {
        self.commands.push(Command::DispatchIndirect(buffer));
    }

    fn begin_rendering(&mut self, desc: &RenderingDesc) {
        self.commands.push(Command::BeginRendering(*desc));
    }

    fn end_rendering(&mut self) {
        self.commands.push(Command::EndRendering);
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, _offset: u64, _index_type: vk::IndexType) {
        self.commands.push(Command::BindIndexBuffer(buffer));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, _offset: u64, _draw_count: u32, stride: u32) {
        self.commands
            .push(Command::DrawIndexedIndirect { buffer, stride });
    }

    fn build_acceleration_structures(
        &mut self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        _ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> multivol_gpu::Result<()> {
        self.require_ray_tracing()?;
        self.commands
            .push(Command::BuildAccelerationStructures(infos.len()));
        Ok(())
    }

    fn trace_rays(
        &mut self,
        _regions: &TraceRaysRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) -> multivol_gpu::Result<()> {
        self.require_ray_tracing()?;
        self.commands.push(Command::TraceRays(width, height, depth));
        Ok(())
    }
}
