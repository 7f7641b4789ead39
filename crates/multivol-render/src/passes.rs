//! Command sequence of one ray caster frame.
//!
//! A frame is cull, optional light propagation, the layer pass (depth peel or
//! ray traced), and the resolve into the caller's target. Every storage image
//! stays in `GENERAL`, so hazards between passes are global memory barriers.

use ash::vk;
use multivol_core::constants::OIT_LAYER_COUNT;
use multivol_gpu::{Access, ColorTarget, CommandRecorder, RenderingDesc, TraceRaysRegions};

use crate::culling::cull_group_count;
use crate::error::Result;
use crate::gpu_types::{CounterReset, DispatchArgs, DrawIndexedArgs, PeelPushConstants};
use crate::loader::voxel_group_count;
use crate::resources::clear_empty_key;

const VERTEX_READ: Access = Access::new(
    vk::PipelineStageFlags2::VERTEX_SHADER,
    vk::AccessFlags2::SHADER_READ,
);

#[derive(Clone, Copy, Debug)]
pub struct PipelineHandles {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

#[derive(Clone, Copy, Debug)]
pub struct RayTraceHandles {
    pub pipeline: PipelineHandles,
    pub regions: TraceRaysRegions,
}

/// Raw handles a frame records against.
#[derive(Clone, Copy, Debug)]
pub struct PassHandles {
    pub frame_set: vk::DescriptorSet,
    pub shared_set: vk::DescriptorSet,
    pub cull: PipelineHandles,
    pub march_l: PipelineHandles,
    pub march_v: PipelineHandles,
    pub peel: PipelineHandles,
    pub render_cube: PipelineHandles,
    pub resolve: PipelineHandles,
    /// Set when the layer pass traces rays instead of peeling.
    pub ray_trace: Option<RayTraceHandles>,
    pub counter_reset: vk::Buffer,
    pub counter: vk::Buffer,
    pub dispatch_args: vk::Buffer,
    pub draw_args: vk::Buffer,
    pub cube_indices: vk::Buffer,
    pub k_depths: vk::Image,
    pub k_depths_range: vk::ImageSubresourceRange,
}

impl PassHandles {
    const fn sets(&self) -> [vk::DescriptorSet; 2] {
        [self.frame_set, self.shared_set]
    }

    const fn ray_tracing(&self) -> bool {
        self.ray_trace.is_some()
    }
}

/// Per-frame sizes and switches.
#[derive(Clone, Copy, Debug)]
pub struct FrameParams {
    pub num_volumes: u32,
    pub light_grid_size: u32,
    /// Size of the layer images and of the resolve pass.
    pub extent: vk::Extent2D,
    pub update_light: bool,
    pub target: ColorTarget,
}

/// Every shader read that can see pass outputs.
pub(crate) const fn shader_reads(ray_tracing: bool) -> Access {
    let raster = Access::COMPUTE_READ
        .and(VERTEX_READ)
        .and(Access::FRAGMENT_READ);
    if ray_tracing {
        raster.and(Access::RAY_TRACING_READ)
    } else {
        raster
    }
}

fn bind<R: CommandRecorder + ?Sized>(
    recorder: &mut R,
    bind_point: vk::PipelineBindPoint,
    pipeline: PipelineHandles,
    sets: &[vk::DescriptorSet],
) {
    recorder.bind_pipeline(bind_point, pipeline.pipeline);
    recorder.bind_descriptor_sets(bind_point, pipeline.layout, 0, sets);
}

/// Reset the counter and indirect arguments, then cull every volume.
pub fn record_cull<R: CommandRecorder + ?Sized>(recorder: &mut R, h: &PassHandles, params: &FrameParams) {
    let reads = shader_reads(h.ray_tracing());
    recorder.memory_barrier(reads.and(Access::INDIRECT_READ), Access::TRANSFER_WRITE);
    let word = std::mem::size_of::<u32>() as u64;
    for (dst, src_offset, size) in [
        (h.counter, CounterReset::COUNT_OFFSET, word),
        (
            h.dispatch_args,
            CounterReset::DISPATCH_OFFSET,
            std::mem::size_of::<DispatchArgs>() as u64,
        ),
        (
            h.draw_args,
            CounterReset::DRAW_OFFSET,
            u64::from(DrawIndexedArgs::SIZE),
        ),
    ] {
        let region = vk::BufferCopy::default().src_offset(src_offset).size(size);
        recorder.copy_buffer(h.counter_reset, dst, &[region]);
    }
    recorder.memory_barrier(
        Access::TRANSFER_WRITE,
        Access::COMPUTE_READ.and(Access::COMPUTE_WRITE),
    );

    bind(recorder, vk::PipelineBindPoint::COMPUTE, h.cull, &h.sets());
    recorder.dispatch(cull_group_count(params.num_volumes), 1, 1);
    recorder.memory_barrier(Access::COMPUTE_WRITE, reads.and(Access::INDIRECT_READ));
}

/// Propagate light from the light source through the visible volumes.
pub fn record_light<R: CommandRecorder + ?Sized>(recorder: &mut R, h: &PassHandles, params: &FrameParams) {
    let reads = shader_reads(h.ray_tracing());
    recorder.memory_barrier(reads, Access::COMPUTE_WRITE);
    bind(recorder, vk::PipelineBindPoint::COMPUTE, h.march_l, &h.sets());
    let groups = voxel_group_count(params.light_grid_size);
    recorder.dispatch(groups, groups, groups);
    recorder.memory_barrier(Access::COMPUTE_WRITE, reads);
}

/// Draw the cube proxies of every visible volume.
fn draw_cubes<R: CommandRecorder + ?Sized>(
    recorder: &mut R,
    h: &PassHandles,
    params: &FrameParams,
    pipeline: PipelineHandles,
    layer: Option<u32>,
) {
    recorder.begin_rendering(&RenderingDesc {
        extent: params.extent,
        color: None,
    });
    bind(recorder, vk::PipelineBindPoint::GRAPHICS, pipeline, &h.sets());
    recorder.bind_index_buffer(h.cube_indices, 0, vk::IndexType::UINT16);
    if let Some(layer) = layer {
        recorder.push_constants(
            pipeline.layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(&PeelPushConstants { layer }),
        );
    }
    recorder.draw_indexed_indirect(h.draw_args, 0, 1, DrawIndexedArgs::SIZE);
    recorder.end_rendering();
}

/// March the cube maps, peel K layers, then shade them from the cube maps.
pub fn record_march_peel<R: CommandRecorder + ?Sized>(
    recorder: &mut R,
    h: &PassHandles,
    params: &FrameParams,
) {
    recorder.memory_barrier(Access::FRAGMENT_READ, Access::COMPUTE_WRITE);
    bind(recorder, vk::PipelineBindPoint::COMPUTE, h.march_v, &h.sets());
    recorder.dispatch_indirect(h.dispatch_args, 0);
    recorder.memory_barrier(Access::COMPUTE_WRITE, Access::FRAGMENT_READ);

    let fragment_rw = Access::FRAGMENT_READ.and(Access::FRAGMENT_WRITE);
    recorder.memory_barrier(fragment_rw, Access::TRANSFER_WRITE);
    recorder.clear_color_image(
        h.k_depths,
        vk::ImageLayout::GENERAL,
        clear_empty_key(),
        h.k_depths_range,
    );
    recorder.memory_barrier(Access::TRANSFER_WRITE, fragment_rw);

    for layer in 0..OIT_LAYER_COUNT {
        draw_cubes(recorder, h, params, h.peel, Some(layer));
        recorder.memory_barrier(Access::FRAGMENT_WRITE, fragment_rw);
    }
    draw_cubes(recorder, h, params, h.render_cube, None);
    recorder.memory_barrier(Access::FRAGMENT_WRITE, Access::FRAGMENT_READ);
}

/// Trace one ray per pixel, keeping the nearest K volume layers.
pub fn record_march_rt<R: CommandRecorder + ?Sized>(
    recorder: &mut R,
    h: &PassHandles,
    rt: &RayTraceHandles,
    params: &FrameParams,
) -> Result<()> {
    recorder.memory_barrier(Access::FRAGMENT_READ, Access::RAY_TRACING_WRITE);
    bind(
        recorder,
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        rt.pipeline,
        &h.sets(),
    );
    recorder.trace_rays(&rt.regions, params.extent.width, params.extent.height, 1)?;
    recorder.memory_barrier(Access::RAY_TRACING_WRITE, Access::FRAGMENT_READ);
    Ok(())
}

/// Blend the sorted layers over the caller's target.
pub fn record_resolve<R: CommandRecorder + ?Sized>(recorder: &mut R, h: &PassHandles, params: &FrameParams) {
    recorder.begin_rendering(&RenderingDesc {
        extent: params.extent,
        color: Some(params.target),
    });
    bind(recorder, vk::PipelineBindPoint::GRAPHICS, h.resolve, &h.sets());
    recorder.draw(3, 1);
    recorder.end_rendering();
}

/// Record a complete frame.
///
/// Acceleration structures must already be current when ray tracing.
pub fn record_frame<R: CommandRecorder + ?Sized>(
    recorder: &mut R,
    h: &PassHandles,
    params: &FrameParams,
) -> Result<()> {
    record_cull(recorder, h, params);
    if params.update_light {
        record_light(recorder, h, params);
    }
    match &h.ray_trace {
        Some(rt) => record_march_rt(recorder, h, rt, params)?,
        None => record_march_peel(recorder, h, params),
    }
    record_resolve(recorder, h, params);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Command, CommandLog};
    use ash::vk::Handle;

    fn pipeline(raw: u64) -> PipelineHandles {
        PipelineHandles {
            pipeline: vk::Pipeline::from_raw(raw),
            layout: vk::PipelineLayout::from_raw(raw),
        }
    }

    fn handles(ray_tracing: bool) -> PassHandles {
        PassHandles {
            frame_set: vk::DescriptorSet::from_raw(1),
            shared_set: vk::DescriptorSet::from_raw(2),
            cull: pipeline(10),
            march_l: pipeline(11),
            march_v: pipeline(12),
            peel: pipeline(13),
            render_cube: pipeline(14),
            resolve: pipeline(15),
            ray_trace: ray_tracing.then(|| RayTraceHandles {
                pipeline: pipeline(16),
                regions: TraceRaysRegions::default(),
            }),
            counter_reset: vk::Buffer::from_raw(20),
            counter: vk::Buffer::from_raw(21),
            dispatch_args: vk::Buffer::from_raw(22),
            draw_args: vk::Buffer::from_raw(23),
            cube_indices: vk::Buffer::from_raw(24),
            k_depths: vk::Image::from_raw(30),
            k_depths_range: vk::ImageSubresourceRange::default().layer_count(OIT_LAYER_COUNT),
        }
    }

    fn params(update_light: bool) -> FrameParams {
        FrameParams {
            num_volumes: 65,
            light_grid_size: 32,
            extent: vk::Extent2D {
                width: 64,
                height: 48,
            },
            update_light,
            target: ColorTarget {
                view: vk::ImageView::from_raw(40),
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        }
    }

    fn record(ray_tracing: bool, update_light: bool) -> CommandLog {
        let mut log = if ray_tracing {
            CommandLog::with_ray_tracing()
        } else {
            CommandLog::default()
        };
        record_frame(&mut log, &handles(ray_tracing), &params(update_light)).unwrap();
        log
    }

    #[test]
    fn counters_reset_before_cull() {
        let log = record(false, false);
        let h = handles(false);
        let copies: Vec<_> = log
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::CopyBuffer { dst, src_offset, size, .. } => Some((*dst, *src_offset, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(
            copies,
            vec![(h.counter, 0, 4), (h.dispatch_args, 4, 12), (h.draw_args, 16, 20)]
        );

        let last_copy = log
            .commands
            .iter()
            .rposition(|c| matches!(c, Command::CopyBuffer { .. }))
            .unwrap();
        let cull = log
            .position(|c| matches!(c, Command::Dispatch(2, 1, 1)))
            .unwrap();
        assert!(last_copy < cull);
    }

    #[test]
    fn light_pass_only_on_request() {
        let light = |c: &Command| matches!(c, Command::Dispatch(8, 8, 8));
        assert_eq!(record(false, false).count(light), 0);
        assert_eq!(record(false, true).count(light), 1);
    }

    #[test]
    fn peel_path_draws_every_layer_then_shades() {
        let log = record(false, true);
        assert_eq!(
            log.count(|c| matches!(c, Command::DrawIndexedIndirect { stride: 20, .. })),
            OIT_LAYER_COUNT as usize + 1
        );
        let layers: Vec<u32> = log
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::PushConstants { stages, data } if *stages == vk::ShaderStageFlags::FRAGMENT => {
                    Some(u32::from_ne_bytes(data[..4].try_into().unwrap()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(layers, (0..OIT_LAYER_COUNT).collect::<Vec<_>>());
        assert_eq!(log.count(|c| matches!(c, Command::DispatchIndirect(_))), 1);
        assert_eq!(
            log.count(|c| matches!(c, Command::Draw { vertex_count: 3, instance_count: 1 })),
            1
        );
        assert_eq!(log.count(|c| matches!(c, Command::TraceRays(..))), 0);
    }

    #[test]
    fn layer_keys_cleared_before_peeling() {
        let log = record(false, false);
        let clear = log
            .position(|c| matches!(c, Command::ClearColorImage { .. }))
            .unwrap();
        let first_peel = log
            .position(|c| matches!(c, Command::DrawIndexedIndirect { .. }))
            .unwrap();
        assert!(clear < first_peel);
    }

    #[test]
    fn rendering_passes_are_balanced() {
        for rt in [false, true] {
            let log = record(rt, true);
            let begins = log.count(|c| matches!(c, Command::BeginRendering(_)));
            assert_eq!(begins, log.count(|c| matches!(c, Command::EndRendering)));
            let mut open = false;
            for command in &log.commands {
                match command {
                    Command::BeginRendering(_) => open = true,
                    Command::EndRendering => open = false,
                    Command::MemoryBarrier { .. } | Command::ClearColorImage { .. } => assert!(!open),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn ray_traced_path_skips_raster_layers() {
        let log = record(true, false);
        assert_eq!(log.count(|c| matches!(c, Command::TraceRays(64, 48, 1))), 1);
        assert_eq!(log.count(|c| matches!(c, Command::DrawIndexedIndirect { .. })), 0);
        assert_eq!(log.count(|c| matches!(c, Command::DispatchIndirect(_))), 0);
        let resolve = log
            .position(|c| matches!(c, Command::BeginRendering(RenderingDesc { color: Some(_), .. })))
            .unwrap();
        let trace = log.position(|c| matches!(c, Command::TraceRays(..))).unwrap();
        assert!(trace < resolve);
    }

    #[test]
    fn ray_stages_only_with_ray_tracing() {
        let log = record(false, true);
        let touches_rt = |c: &Command| match c {
            Command::MemoryBarrier { src, dst } => (src.stage | dst.stage)
                .contains(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR),
            _ => false,
        };
        assert_eq!(log.count(touches_rt), 0);
        assert!(record(true, true).count(touches_rt) > 0);
    }

    #[test]
    fn tracing_without_support_fails() {
        let mut log = CommandLog::default();
        let result = record_frame(&mut log, &handles(true), &params(false));
        assert!(result.is_err());
    }
}
