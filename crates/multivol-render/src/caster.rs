//! The multi-volume ray caster.
//!
//! Owns every GPU object of the technique. Configuration calls change host
//! state or descriptor bindings; [`MultiRayCaster::update_frame`] writes the
//! frame slot's constants and [`MultiRayCaster::render`] records the passes.

use std::path::Path;

use ash::vk;
use glam::Vec3;
use multivol_core::{FrameClock, FrameIndex, FRAME_COUNT};
use multivol_gpu::{Access, ColorTarget, CommandRecorder, DeferredDeletionQueue, GpuContext};

use crate::config::{OitMethod, RayCasterConfig};
use crate::descriptors::{CasterDescriptors, LightTable, SampledImage};
use crate::error::{RenderError, Result};
use crate::loader::{decode_volume_file, FillPasses, SourceKind, VolumeSources};
use crate::passes::{
    record_cull, record_frame, record_light, shader_reads, FrameParams, PassHandles,
    PipelineHandles, RayTraceHandles,
};
use crate::pipelines::CasterPipelines;
use crate::ray_tracing::VolumeAccel;
use crate::resources::{CasterBuffers, CasterImages, GpuVisibility, Samplers, Texture};
use crate::scene::{FrameView, SceneState};

/// Validate a caller-supplied frame slot.
pub fn check_frame_index(index: u8) -> Result<FrameIndex> {
    FrameIndex::new(index).map_err(|_| RenderError::InvalidFrameIndex(index))
}

/// Renders many volumes with light propagation and order-independent
/// transparency.
pub struct MultiRayCaster {
    config: RayCasterConfig,
    oit_method: OitMethod,
    scene: SceneState,
    clock: FrameClock,
    buffers: CasterBuffers,
    images: CasterImages,
    samplers: Samplers,
    descriptors: CasterDescriptors,
    pipelines: CasterPipelines,
    sources: VolumeSources,
    /// Present when the device supports hardware ray tracing.
    accel: Option<VolumeAccel>,
    uploads: DeferredDeletionQueue,
}

impl MultiRayCaster {
    /// Create every GPU object for `config`.
    ///
    /// Requesting ray tracing on a device without it falls back to depth
    /// peeling.
    ///
    /// # Safety
    /// The context must outlive the caster, and [`Self::destroy`] must be
    /// called before it is dropped.
    pub unsafe fn new(ctx: &GpuContext, config: RayCasterConfig) -> Result<Self> {
        config.validate()?;
        let max_layers = ctx.capabilities().max_image_array_layers;
        if config.cube_layers() > max_layers {
            return Err(RenderError::InvalidConfig(format!(
                "{} cube layers exceed the device limit of {max_layers}",
                config.cube_layers()
            )));
        }
        let device = ctx.device();
        let rt = ctx.ray_tracing();

        let oit_method = match (config.oit_method, rt) {
            (OitMethod::RayTracing, None) => {
                tracing::warn!("ray tracing unavailable; using depth peeling");
                OitMethod::DepthPeeling
            }
            (method, _) => method,
        };

        let scene = SceneState::new(config.num_volumes);
        let mut allocator = ctx.allocator().lock();
        let buffers = CasterBuffers::new(&mut allocator, &config)?;
        let images = CasterImages::new(device, &mut allocator, &config, scene.viewport())?;
        let samplers = Samplers::new(device)?;
        let descriptors = CasterDescriptors::new(device, config.num_volume_srcs, rt.is_some())?;

        descriptors.write_frames(device, &buffers);
        descriptors.write_shared(device, &buffers, &images, &samplers);
        descriptors.write_light_table(device, &images, &samplers);
        // Until a file arrives the source binding only needs a valid view.
        let no_file = SampledImage::from(&images.light_map);
        for (slot, volume) in images.volumes.iter().enumerate() {
            descriptors.write_volume_init(device, &samplers, slot, no_file, volume.into());
        }

        let pipelines = CasterPipelines::new(
            device,
            &descriptors.pass_layouts(),
            descriptors.volume_init_layout,
            config.target_format,
        )?;

        let accel = match rt {
            Some(rt) => {
                let accel = VolumeAccel::new(
                    device,
                    rt,
                    &mut allocator,
                    config.proxy_bounds(),
                    config.num_volumes,
                    &descriptors.pass_layouts(),
                )?;
                descriptors.write_tlas(device, accel.tlas_handle());
                Some(accel)
            }
            None => None,
        };
        drop(allocator);

        tracing::info!(
            num_volumes = config.num_volumes,
            num_volume_srcs = config.num_volume_srcs,
            grid_size = config.grid_size,
            light_grid_size = config.light_grid_size,
            oit = oit_method.name(),
            "created multi-volume ray caster"
        );

        Ok(Self {
            sources: VolumeSources::new(config.num_volume_srcs),
            config,
            oit_method,
            scene,
            clock: FrameClock::new(),
            buffers,
            images,
            samplers,
            descriptors,
            pipelines,
            accel,
            uploads: DeferredDeletionQueue::new(FRAME_COUNT),
        })
    }

    pub const fn config(&self) -> &RayCasterConfig {
        &self.config
    }

    pub const fn scene(&self) -> &SceneState {
        &self.scene
    }

    pub const fn oit_method(&self) -> OitMethod {
        self.oit_method
    }

    pub const fn ray_tracing_supported(&self) -> bool {
        self.accel.is_some()
    }

    pub fn num_volumes(&self) -> u32 {
        self.scene.num_volumes()
    }

    /// Entries in the visible list, one per configured volume.
    pub const fn visible_capacity(&self) -> u32 {
        self.config.num_volumes
    }

    fn ray_tracing_active(&self) -> bool {
        self.oit_method == OitMethod::RayTracing && self.accel.is_some()
    }

    fn consumers(&self) -> Access {
        shader_reads(self.accel.is_some())
    }

    /// Read volume file `path` into the source slot of volume `index` and
    /// record its upload. Volumes sharing a slot (`index % num_volume_srcs`)
    /// share the data.
    ///
    /// The file is decoded before any GPU object is touched, so a missing or
    /// malformed file returns [`RenderError::VolumeLoad`] with the slot
    /// unchanged. On success the slot's fill pass is recorded by the next
    /// [`Self::init_volume_data`] or [`Self::render`]. The recorded commands
    /// must be submitted before `FRAME_COUNT` further frames start.
    ///
    /// # Safety
    /// No pending command buffer may still use the slot's fill pass.
    pub unsafe fn load_volume_data<R: CommandRecorder + ?Sized>(
        &mut self,
        ctx: &GpuContext,
        recorder: &mut R,
        index: u32,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let slot = self.config.volume_slot(index)?;
        let texture = decode_volume_file(
            index,
            path.as_ref(),
            ctx.capabilities().max_image_dimension_3d,
        )?;

        let device = ctx.device();
        let mut allocator = ctx.allocator().lock();
        let staging = self
            .sources
            .stage_upload(device, &mut allocator, recorder, slot, &texture)?;
        self.uploads.queue(staging, self.clock.frames_started());

        if let Some(view) = self.sources.file_view(slot)? {
            let file = SampledImage {
                view,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };
            let target = SampledImage::from(&self.images.volumes[slot as usize]);
            self.descriptors
                .write_volume_init(device, &self.samplers, slot as usize, file, target);
        }
        Ok(())
    }

    /// Record the pass that fills the source slot of volume `index` from its file, or with
    /// the procedural placeholder if no file was loaded.
    pub fn init_volume_data<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R, index: u32) -> Result<()> {
        let slot = self.config.volume_slot(index)?;
        let consumers = self.consumers();
        self.images.record_pending_init(recorder, consumers);
        let passes = self.fill_passes();
        self.sources.record_fill(
            recorder,
            &passes,
            slot,
            &self.images.volumes[slot as usize],
            consumers,
        )
    }

    /// What the source slot of volume `index` is filled from.
    pub fn volume_source(&self, index: u32) -> Result<SourceKind> {
        self.sources.kind(self.config.volume_slot(index)?)
    }

    fn fill_passes(&self) -> FillPasses {
        FillPasses {
            load_pipeline: self.pipelines.load.pipeline,
            load_layout: self.pipelines.load.layout,
            init_pipeline: self.pipelines.init.pipeline,
            init_layout: self.pipelines.init.layout,
            init_sets: self.descriptors.volume_init_sets.clone(),
        }
    }

    fn record_pending_fills<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R) -> Result<()> {
        let pending: Vec<u32> = self.sources.pending().collect();
        if pending.is_empty() {
            return Ok(());
        }
        let consumers = self.consumers();
        let passes = self.fill_passes();
        for index in pending {
            self.sources.record_fill(
                recorder,
                &passes,
                index,
                &self.images.volumes[index as usize],
                consumers,
            )?;
        }
        Ok(())
    }

    /// Bind the caller's scene and shadow depth maps.
    ///
    /// # Safety
    /// The views must stay valid while bound, and no pending command buffer
    /// may use the caster's shared descriptor set.
    pub unsafe fn set_depth_maps(&mut self, device: &ash::Device, scene: SampledImage, shadow: SampledImage) {
        self.descriptors
            .write_depth_maps(device, &self.samplers, scene, shadow);
    }

    /// Bind an irradiance cube map, or the black placeholder for `None`.
    ///
    /// # Safety
    /// As for [`Self::set_depth_maps`].
    pub unsafe fn set_irradiance(&mut self, device: &ash::Device, irradiance: Option<SampledImage>) {
        let probe = irradiance.unwrap_or_else(|| SampledImage::from(&self.images.placeholder_irradiance));
        self.descriptors
            .write_irradiance(device, &self.samplers, probe);
        self.scene.set_has_irradiance(irradiance.is_some());
    }

    /// Set the render size. Resizing the layer images waits for the device.
    pub fn set_viewport(&mut self, ctx: &GpuContext, width: u32, height: u32) -> Result<()> {
        self.scene.set_viewport(width, height);
        let viewport = self.scene.viewport();
        if self.images.layer_extent() == viewport {
            return Ok(());
        }

        ctx.wait_idle()?;
        let device = ctx.device();
        let mut allocator = ctx.allocator().lock();
        // SAFETY: the device is idle, so neither the layer images nor the
        // shared set are in use.
        unsafe {
            self.images.resize_layers(device, &mut allocator, viewport)?;
            self.descriptors.write_layers(device, &self.images);
        }
        tracing::debug!(width = viewport[0], height = viewport[1], "resized layer images");
        Ok(())
    }

    pub fn set_max_samples(&mut self, max_ray_samples: u32, max_light_samples: u32) {
        self.scene.set_max_samples(max_ray_samples, max_light_samples);
    }

    /// Place every volume on a lattice of spacing `size` around `center`.
    pub fn set_volumes_world(&mut self, size: f32, center: Vec3) {
        self.scene.set_volumes_world(size, center);
    }

    pub fn set_volume_world(&mut self, index: u32, size: f32, pos: Vec3) -> Result<()> {
        self.scene.set_volume_world(index, size, pos)
    }

    pub fn set_light_map_world(&mut self, size: f32, pos: Vec3) {
        self.scene.light.set_light_map_world(size, pos);
    }

    pub fn set_light(&mut self, position: Vec3, color: Vec3, intensity: f32) {
        self.scene.light.set_light(position, color, intensity);
    }

    pub fn set_ambient(&mut self, color: Vec3, intensity: f32) {
        self.scene.light.set_ambient(color, intensity);
    }

    /// Switch the layer strategy. Waits for the device when it changes.
    pub fn set_oit_method(&mut self, ctx: &GpuContext, method: OitMethod) -> Result<()> {
        if method == OitMethod::RayTracing && self.accel.is_none() {
            return Err(RenderError::InvalidConfig(
                "ray tracing is not supported by this device".to_string(),
            ));
        }
        if method != self.oit_method {
            ctx.wait_idle()?;
            self.oit_method = method;
            tracing::info!(oit = method.name(), "switched OIT method");
        }
        Ok(())
    }

    /// Write the per-frame constants of slot `frame_index` for `view`.
    ///
    /// The caller must have waited for the slot's previous submission.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update_frame(&mut self, ctx: &GpuContext, frame_index: u8, view: &FrameView) -> Result<()> {
        let frame = check_frame_index(frame_index)?;
        self.clock.advance(frame);
        self.uploads
            .process(&mut ctx.allocator().lock(), self.clock.frames_started())?;

        let cb = self.scene.per_frame_constants(
            view,
            self.config.grid_size,
            self.config.light_grid_size,
        );
        let objects = self.scene.per_objects(view);
        self.buffers.write_frame(frame, &cb, &objects)?;
        Ok(())
    }

    fn pass_handles(&self, frame: FrameIndex, ray_trace: bool) -> PassHandles {
        let graphics = |p: &multivol_gpu::GraphicsPipeline| PipelineHandles {
            pipeline: p.pipeline,
            layout: p.layout,
        };
        let compute = |p: &multivol_gpu::ComputePipeline| PipelineHandles {
            pipeline: p.pipeline,
            layout: p.layout,
        };
        let ray_trace = if ray_trace {
            self.accel.as_ref().map(|accel| RayTraceHandles {
                pipeline: PipelineHandles {
                    pipeline: accel.pipeline(),
                    layout: accel.layout(),
                },
                regions: accel.regions(),
            })
        } else {
            None
        };
        PassHandles {
            frame_set: self.descriptors.frame_sets[frame],
            shared_set: self.descriptors.shared_set,
            cull: compute(&self.pipelines.cull),
            march_l: compute(&self.pipelines.march_l),
            march_v: compute(&self.pipelines.march_v),
            peel: graphics(&self.pipelines.peel),
            render_cube: graphics(&self.pipelines.render_cube),
            resolve: graphics(&self.pipelines.resolve),
            ray_trace,
            counter_reset: self.buffers.counter_reset.buffer,
            counter: self.buffers.counter.buffer,
            dispatch_args: self.buffers.dispatch_args.buffer,
            draw_args: self.buffers.draw_args.buffer,
            cube_indices: self.buffers.cube_indices.buffer,
            k_depths: self.images.k_depths.image.image,
            k_depths_range: self.images.k_depths.image.color_range(),
        }
    }

    fn frame_params(&self, update_light: bool, target: ColorTarget) -> FrameParams {
        let [width, height] = self.scene.viewport();
        FrameParams {
            num_volumes: self.scene.num_volumes(),
            light_grid_size: self.config.light_grid_size,
            extent: vk::Extent2D { width, height },
            update_light,
            target,
        }
    }

    /// Record a frame into `target`, which must be in `COLOR_ATTACHMENT_OPTIMAL`
    /// and match the viewport.
    ///
    /// Light propagation runs when `update_light` is set or the light volume
    /// was never computed; otherwise the previous light volume is reused.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render<R: CommandRecorder + ?Sized>(
        &mut self,
        ctx: &GpuContext,
        recorder: &mut R,
        frame_index: u8,
        target: ColorTarget,
        update_light: bool,
    ) -> Result<()> {
        let frame = check_frame_index(frame_index)?;
        let consumers = self.consumers();
        self.images.record_pending_init(recorder, consumers);
        self.record_pending_fills(recorder)?;

        let ray_trace = self.ray_tracing_active();
        if ray_trace {
            if let Some(accel) = self.accel.as_mut() {
                // SAFETY: the recorder targets a command buffer of this device.
                unsafe {
                    accel.record_builds(
                        recorder,
                        ctx.device(),
                        frame,
                        self.scene.worlds(),
                        self.scene.generation(),
                    )?;
                }
            }
        }

        let update_light = self.scene.light.should_propagate(update_light);
        let handles = self.pass_handles(frame, ray_trace);
        record_frame(recorder, &handles, &self.frame_params(update_light, target))?;
        if update_light {
            self.scene.light.mark_propagated();
        }
        Ok(())
    }

    /// Record light propagation alone, for callers that update the light
    /// volume outside [`Self::render`].
    pub fn ray_march_l<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R, frame_index: u8) -> Result<()> {
        let frame = check_frame_index(frame_index)?;
        let consumers = self.consumers();
        self.images.record_pending_init(recorder, consumers);
        self.record_pending_fills(recorder)?;

        let handles = self.pass_handles(frame, false);
        let params = self.frame_params(true, ColorTarget {
            view: vk::ImageView::null(),
            layout: vk::ImageLayout::UNDEFINED,
        });
        record_cull(recorder, &handles, &params);
        record_light(recorder, &handles, &params);
        self.scene.light.mark_propagated();
        Ok(())
    }

    /// The light volume as a standalone descriptor table.
    pub const fn light_srv_table(&self) -> LightTable {
        self.descriptors.light_table()
    }

    /// The light volume texture, in `GENERAL` layout.
    pub const fn light_map(&self) -> &Texture {
        &self.images.light_map
    }

    /// Culling results of the most recently retired frame.
    pub fn read_visibility(&self) -> Result<GpuVisibility> {
        self.buffers.read_visibility(self.scene.num_volumes())
    }

    /// Wait for the device and release every GPU object.
    ///
    /// # Safety
    /// `ctx` must be the context the caster was created with.
    pub unsafe fn destroy(mut self, ctx: &GpuContext) -> Result<()> {
        ctx.wait_idle()?;
        let device = ctx.device();
        let mut allocator = ctx.allocator().lock();

        self.uploads.flush(&mut allocator)?;
        if let (Some(accel), Some(rt)) = (self.accel.take(), ctx.ray_tracing()) {
            accel.destroy(device, rt, &mut allocator)?;
        }
        self.pipelines.destroy(device);
        self.descriptors.destroy(device);
        self.samplers.destroy(device);
        self.sources.destroy(device, &mut allocator)?;
        self.images.destroy(device, &mut allocator)?;
        self.buffers.destroy(&mut allocator)?;

        tracing::debug!("destroyed multi-volume ray caster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slots_are_validated() {
        for i in 0..FRAME_COUNT as u8 {
            assert_eq!(check_frame_index(i).unwrap().get(), i);
        }
        assert!(matches!(
            check_frame_index(FRAME_COUNT as u8),
            Err(RenderError::InvalidFrameIndex(3))
        ));
        assert!(matches!(
            check_frame_index(u8::MAX),
            Err(RenderError::InvalidFrameIndex(255))
        ));
    }
}
