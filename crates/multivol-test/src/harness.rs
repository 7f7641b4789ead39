//! Test harness for headless rendering and visual regression testing.
//!
//! This module drives a [`MultiRayCaster`] into an offscreen target without a
//! display, cycling the frame ring the way an application would.

use std::path::Path;

use ash::vk;
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use image::{ImageBuffer, Rgba, RgbaImage};
use multivol_core::{FrameIndex, FrameRing, FRAME_COUNT};
use multivol_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use multivol_gpu::{
    Access, CommandPool, CommandRecorder, FrameFences, GpuContext, GpuContextBuilder, GpuError,
    VulkanRecorder,
};
use multivol_render::{
    Camera, CaptureTarget, FrameView, GpuVisibility, MultiRayCaster, OitMethod, RenderSettings,
    SourceKind, CAPTURE_FORMAT,
};

use crate::{Result, TestError, VisualTestConfig};

/// Bytes per light map texel (RGBA16F).
const LIGHT_TEXEL_BYTES: u64 = 8;

const HOST_READ: Access = Access::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ);

/// Headless renderer for testing.
///
/// Owns a GPU context, a ray caster, and an offscreen capture target.
pub struct HeadlessRenderer {
    caster: Option<MultiRayCaster>,
    target: CaptureTarget,
    pool: CommandPool,
    command_buffers: FrameRing<vk::CommandBuffer>,
    fences: FrameFences,
    frame: FrameIndex,
    clear_color: [f32; 4],
    context: GpuContext,
}

impl HeadlessRenderer {
    /// Create a renderer for `settings`, loading every listed volume file.
    pub fn new(settings: &RenderSettings) -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("multivol-test")
            .validation(true)
            .build()?;
        let device = context.device();
        let (width, height) = (settings.width, settings.height);

        let pool = unsafe {
            CommandPool::new(
                device,
                context.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let buffers = unsafe {
            pool.allocate_command_buffers(device, vk::CommandBufferLevel::PRIMARY, FRAME_COUNT as u32)?
        };
        let command_buffers = FrameRing::from_fn(|i| buffers[i]);
        let fences = unsafe { FrameFences::new(device)? };
        let target = unsafe { CaptureTarget::new(device, &mut context.allocator().lock(), width, height)? };

        let mut caster =
            unsafe { MultiRayCaster::new(&context, settings.ray_caster_config(CAPTURE_FORMAT))? };
        caster.set_viewport(&context, width, height)?;
        caster.set_max_samples(settings.max_ray_samples, settings.max_light_samples);
        let [x, y, z, spacing] = settings.volume_pos_scale;
        let center = Vec3::new(x, y, z);
        caster.set_volumes_world(spacing, center);
        caster.set_light_map_world(settings.light_map_scale, center);
        caster.set_light(center + Vec3::new(4.0, 10.0, 6.0), Vec3::ONE, 1.0);
        caster.set_ambient(Vec3::ONE, 0.1);

        let mut renderer = Self {
            caster: Some(caster),
            target,
            pool,
            command_buffers,
            fences,
            frame: FrameIndex::default(),
            clear_color: settings.clear_color,
            context,
        };
        for (i, path) in settings.volume_files.iter().enumerate() {
            renderer.load_volume(i as u32, path)?;
        }
        Ok(renderer)
    }

    pub fn caster(&self) -> Result<&MultiRayCaster> {
        self.caster.as_ref().ok_or_else(caster_destroyed)
    }

    pub fn caster_mut(&mut self) -> Result<&mut MultiRayCaster> {
        self.caster.as_mut().ok_or_else(caster_destroyed)
    }

    pub const fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Record with a one-off command buffer and wait for it to finish.
    fn submit_once<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&mut MultiRayCaster, &GpuContext, &mut VulkanRecorder<'_>) -> Result<()>,
    {
        let device = self.context.device();
        let caster = self.caster.as_mut().ok_or_else(caster_destroyed)?;
        unsafe {
            let cmd = self
                .pool
                .allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)?;
            let result = (|| {
                begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
                let mut recorder = VulkanRecorder::new(device, self.context.ray_tracing(), cmd);
                let recorded = record(caster, &self.context, &mut recorder);
                end_command_buffer(device, cmd)?;
                recorded?;
                submit_command_buffers(device, self.context.graphics_queue(), &[cmd], vk::Fence::null())?;
                self.context.wait_idle()?;
                Ok(())
            })();
            device.free_command_buffers(self.pool.handle(), &[cmd]);
            result
        }
    }

    /// Load a volume file into source slot `index` and upload it.
    pub fn load_volume(&mut self, index: u32, path: &Path) -> Result<()> {
        self.submit_once(|caster, ctx, recorder| {
            unsafe { caster.load_volume_data(ctx, recorder, index, path)? };
            caster.init_volume_data(recorder, index)?;
            Ok(())
        })
    }

    /// Record and submit one frame. Pixels are available after [`Self::finish`].
    pub fn render_frame(&mut self, view: &FrameView, update_light: bool) -> Result<()> {
        let frame = self.frame;
        let cmd = self.command_buffers[frame];
        let device = self.context.device();
        let caster = self.caster.as_mut().ok_or_else(caster_destroyed)?;

        unsafe {
            self.fences.acquire(device, frame)?;
            caster.update_frame(&self.context, frame.get(), view)?;

            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(GpuError::Vulkan)?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            let mut recorder = VulkanRecorder::new(device, self.context.ray_tracing(), cmd);
            self.target.record_clear(&mut recorder, self.clear_color);
            caster.render(
                &self.context,
                &mut recorder,
                frame.get(),
                self.target.color_target(),
                update_light,
            )?;
            self.target.record_readback(&mut recorder);
            end_command_buffer(device, cmd)?;

            submit_command_buffers(
                device,
                self.context.graphics_queue(),
                &[cmd],
                self.fences.fence(frame),
            )?;
        }

        self.frame = frame.next();
        Ok(())
    }

    /// Wait for every submitted frame and return the last frame's pixels.
    pub fn finish(&self) -> Result<RgbaImage> {
        unsafe { self.fences.wait_all(self.context.device())? };
        let (width, height) = self.target.dimensions();
        let data = self.target.read_pixels()?;
        ImageBuffer::from_raw(width, height, data)
            .ok_or_else(|| TestError::ImageComparison("readback size mismatch".to_string()))
    }

    /// Render a single frame and read it back.
    pub fn render_image(&mut self, view: &FrameView, update_light: bool) -> Result<RgbaImage> {
        self.render_frame(view, update_light)?;
        self.finish()
    }

    /// Culling results of the last finished frame.
    pub fn visibility(&self) -> Result<GpuVisibility> {
        Ok(self.caster()?.read_visibility()?)
    }

    pub fn volume_source(&self, index: u32) -> Result<SourceKind> {
        Ok(self.caster()?.volume_source(index)?)
    }

    pub fn set_oit_method(&mut self, method: OitMethod) -> Result<()> {
        let caster = self.caster.as_mut().ok_or_else(caster_destroyed)?;
        caster.set_oit_method(&self.context, method)?;
        Ok(())
    }

    /// Copy the light volume to the host as raw RGBA16F texels.
    pub fn read_light_map(&mut self) -> Result<Vec<u8>> {
        let (image, extent, range) = {
            let light = self.caster()?.light_map();
            (light.image.image, light.image.extent, light.image.color_range())
        };
        let size = u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth)
            * LIGHT_TEXEL_BYTES;
        let mut buffer = self.context.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "light_map_readback",
        )?;
        let dst = buffer.buffer;

        let copied = self.submit_once(|_, _, recorder| {
            recorder.memory_barrier(Access::COMPUTE_WRITE, Access::TRANSFER_READ);
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(range.aspect_mask)
                        .layer_count(1),
                )
                .image_extent(extent);
            recorder.copy_image_to_buffer(image, vk::ImageLayout::GENERAL, dst, &[region]);
            recorder.memory_barrier(Access::TRANSFER_WRITE, HOST_READ);
            Ok(())
        });
        let texels = copied.and_then(|()| Ok(buffer.read_bytes(0, size as usize)?));
        self.context.allocator().lock().free_buffer(&mut buffer)?;
        texels
    }

    /// Get the output dimensions.
    pub const fn dimensions(&self) -> (u32, u32) {
        self.target.dimensions()
    }
}

fn caster_destroyed() -> TestError {
    TestError::Gpu(GpuError::InvalidState("ray caster already destroyed".to_string()))
}

impl Drop for HeadlessRenderer {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            let _ = self.fences.wait_all(device);
            if let Some(caster) = self.caster.take() {
                if let Err(e) = caster.destroy(&self.context) {
                    tracing::warn!("failed to destroy ray caster: {e}");
                }
            }
            if let Err(e) = self
                .target
                .destroy(device, &mut self.context.allocator().lock())
            {
                tracing::warn!("failed to destroy capture target: {e}");
            }
            self.fences.destroy(device);
            self.pool.destroy(device);
        }
    }
}

/// Visual regression test runner.
///
/// Compares rendered images against baseline images and reports differences.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
    renderer: HeadlessRenderer,
}

impl VisualRegressionTest {
    pub fn new(config: VisualTestConfig, settings: &RenderSettings) -> Result<Self> {
        let renderer = HeadlessRenderer::new(settings)?;
        Ok(Self { config, renderer })
    }

    pub fn renderer(&mut self) -> &mut HeadlessRenderer {
        &mut self.renderer
    }

    /// Render `view` through a full frame ring and compare the last frame.
    pub fn run_test(&mut self, name: &str, view: &FrameView) -> Result<()> {
        for _ in 0..FRAME_COUNT {
            self.renderer.render_frame(view, true)?;
        }
        let image = self.renderer.finish()?;
        self.compare_and_save(name, &image)
    }

    fn compare_and_save(&self, name: &str, image: &RgbaImage) -> Result<()> {
        std::fs::create_dir_all(&self.config.baseline_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let baseline_path = format!("{}/{}.png", self.config.baseline_dir, name);
        let output_path = format!("{}/{}.png", self.config.output_dir, name);
        image.save(&output_path)?;

        if Path::new(&baseline_path).exists() {
            let baseline = image::open(&baseline_path)?.to_rgba8();
            let diff = image_difference(&baseline, image)?;
            if diff > self.config.threshold {
                let diff_path = format!("{}/{}_diff.png", self.config.output_dir, name);
                diff_image(&baseline, image).save(&diff_path)?;

                return Err(TestError::ImageComparison(format!(
                    "Image difference {:.4} exceeds threshold {:.4} (see {})",
                    diff, self.config.threshold, diff_path
                )));
            }
        } else {
            image.save(&baseline_path)?;
            tracing::info!("Created new baseline: {}", baseline_path);
        }

        Ok(())
    }
}

/// Normalized RGB difference of two images (0.0-1.0).
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 3 * 255) as f64;
    Ok(total_diff as f64 / max_diff)
}

/// Differing pixels in red over the dimmed baseline.
fn diff_image(a: &RgbaImage, b: &RgbaImage) -> RgbaImage {
    let (width, height) = a.dimensions();
    let mut diff = ImageBuffer::new(width, height);

    for (x, y, pixel) in diff.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
        *pixel = if max_diff > 10 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pa[0] / 2, pa[1] / 2, pa[2] / 2, 255])
        };
    }

    diff
}

/// Camera orbiting the volume lattice of `settings`.
pub fn test_camera(settings: &RenderSettings, distance_factor: f32) -> Camera {
    let [x, y, z, spacing] = settings.volume_pos_scale;
    let side = (settings.num_volumes as f32).cbrt().ceil();
    let radius = side * spacing * distance_factor;
    Camera::orbit(
        Vec3::new(x, y, z),
        radius,
        0.6,
        0.35,
        settings.width as f32 / settings.height as f32,
    )
}

/// Light-space matrix used as the shadow transform in tests.
pub fn test_shadow_view_proj() -> Mat4 {
    Mat4::orthographic_rh(-16.0, 16.0, -16.0, 16.0, 0.1, 64.0)
        * Mat4::look_at_rh(Vec3::new(4.0, 10.0, 6.0), Vec3::ZERO, Vec3::Y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multivol_core::{VolumeFormat, VolumeTexture};
    use multivol_render::{cull_volumes, RenderError};

    fn small_settings() -> RenderSettings {
        RenderSettings {
            width: 160,
            height: 120,
            grid_size: 32,
            light_grid_size: 16,
            num_volumes: 8,
            clear_color: [0.25, 0.5, 0.75, 1.0],
            ..RenderSettings::default()
        }
    }

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbaImage {
        ImageBuffer::from_pixel(width, height, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn identical_images_do_not_differ() {
        let a = solid(4, 4, [10, 20, 30]);
        assert_eq!(image_difference(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_fully() {
        let black = solid(2, 2, [0, 0, 0]);
        let white = solid(2, 2, [255, 255, 255]);
        assert!((image_difference(&black, &white).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_sizes_are_an_error() {
        let a = solid(2, 2, [0, 0, 0]);
        let b = solid(3, 2, [0, 0, 0]);
        assert!(matches!(
            image_difference(&a, &b),
            Err(TestError::ImageComparison(_))
        ));
    }

    #[test]
    fn diff_image_marks_changed_pixels() {
        let a = solid(2, 1, [100, 100, 100]);
        let mut b = a.clone();
        b.put_pixel(1, 0, Rgba([200, 100, 100, 255]));
        let diff = diff_image(&a, &b);
        assert_eq!(*diff.get_pixel(0, 0), Rgba([50, 50, 50, 255]));
        assert_eq!(*diff.get_pixel(1, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_camera_looks_at_the_lattice() {
        let settings = small_settings();
        let camera = test_camera(&settings, 2.0);
        let center = Vec3::from_slice(&settings.volume_pos_scale[..3]);
        let to_center = (center - camera.position).normalize();
        assert!(camera.direction.dot(to_center) > 0.999);
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_renderer_creation() {
        let renderer = HeadlessRenderer::new(&small_settings()).unwrap();
        assert_eq!(renderer.dimensions(), (160, 120));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn visible_count_matches_host_culling() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let view = test_camera(&settings, 1.2).frame_view(test_shadow_view_proj());
        renderer.render_image(&view, true).unwrap();

        let caster = renderer.caster().unwrap();
        let host = cull_volumes(
            caster.scene().worlds(),
            &view.view_proj,
            caster.scene().viewport(),
            settings.grid_size,
        );
        let gpu = renderer.visibility().unwrap();
        assert_eq!(gpu.visible_count, host.visible_count());
        assert_eq!(gpu.visible(), host.visible);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn empty_view_keeps_the_clear_color() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let mut camera = test_camera(&settings, 2.0);
        camera.direction = -camera.direction;
        let image = renderer
            .render_image(&camera.frame_view(test_shadow_view_proj()), true)
            .unwrap();

        assert_eq!(renderer.visibility().unwrap().visible_count, 0);
        let expected = Rgba([64, 128, 191, 255]);
        for pixel in image.pixels() {
            for c in 0..4 {
                assert!(pixel[c].abs_diff(expected[c]) <= 1, "{pixel:?}");
            }
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn volumes_cover_part_of_the_frame() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let view = test_camera(&settings, 2.0).frame_view(test_shadow_view_proj());
        let image = renderer.render_image(&view, true).unwrap();

        let background = solid(image.width(), image.height(), [64, 128, 191]);
        assert!(image_difference(&background, &image).unwrap() > 0.0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn light_map_is_kept_without_update() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let view = test_camera(&settings, 2.0).frame_view(test_shadow_view_proj());
        renderer.render_image(&view, true).unwrap();
        let before = renderer.read_light_map().unwrap();

        renderer
            .caster_mut()
            .unwrap()
            .set_light(Vec3::new(-8.0, 2.0, 0.0), Vec3::new(1.0, 0.2, 0.2), 4.0);
        renderer.render_image(&view, false).unwrap();
        assert_eq!(renderer.read_light_map().unwrap(), before);

        renderer.render_image(&view, true).unwrap();
        assert_ne!(renderer.read_light_map().unwrap(), before);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn malformed_volume_file_leaves_the_slot_alone() {
        let path = std::env::temp_dir().join(format!("multivol_bad_{}.dds", std::process::id()));
        std::fs::write(&path, b"DDS \x00\x01").unwrap();

        let mut renderer = HeadlessRenderer::new(&small_settings()).unwrap();
        let err = renderer.load_volume(0, &path).unwrap_err();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            err,
            TestError::Render(RenderError::VolumeLoad { index: 0, .. })
        ));
        assert_eq!(renderer.volume_source(0).unwrap(), SourceKind::Placeholder);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn loaded_volume_becomes_the_source() {
        let path = std::env::temp_dir().join(format!("multivol_ok_{}.dds", std::process::id()));
        let texture = VolumeTexture::new(8, 8, 8, VolumeFormat::R8Unorm, vec![200; 512]).unwrap();
        std::fs::write(&path, texture.to_dds_bytes()).unwrap();

        let mut renderer = HeadlessRenderer::new(&small_settings()).unwrap();
        renderer.load_volume(0, &path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            renderer.volume_source(0).unwrap(),
            SourceKind::File { channel_count: 1 }
        );
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn light_table_and_capacity_are_exposed() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let caster = renderer.caster_mut().unwrap();
        assert_eq!(caster.visible_capacity(), settings.num_volumes);

        let table = caster.light_srv_table();
        assert_ne!(table.layout, vk::DescriptorSetLayout::null());
        assert_ne!(table.set, vk::DescriptorSet::null());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clearing_the_irradiance_probe_still_renders() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        let view = test_camera(&settings, 2.0).frame_view(test_shadow_view_proj());
        renderer.render_image(&view, true).unwrap();

        let device = renderer.context().device().clone();
        unsafe { renderer.caster_mut().unwrap().set_irradiance(&device, None) };
        let image = renderer.render_image(&view, false).unwrap();
        assert_eq!(image.dimensions(), (160, 120));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn lattice_matches_baseline() {
        let settings = small_settings();
        let config = VisualTestConfig {
            threshold: 0.01,
            ..VisualTestConfig::default()
        };
        let mut test = VisualRegressionTest::new(config, &settings).unwrap();
        let view = test_camera(&settings, 2.0).frame_view(test_shadow_view_proj());
        test.run_test("lattice_default", &view).unwrap();
        assert_eq!(test.renderer().dimensions(), (160, 120));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn ray_traced_layers_match_depth_peeling() {
        let settings = small_settings();
        let mut renderer = HeadlessRenderer::new(&settings).unwrap();
        if !renderer.caster().unwrap().ray_tracing_supported() {
            return;
        }
        let view = test_camera(&settings, 2.0).frame_view(test_shadow_view_proj());
        let peeled = renderer.render_image(&view, true).unwrap();

        renderer.set_oit_method(OitMethod::RayTracing).unwrap();
        let traced = renderer.render_image(&view, false).unwrap();
        assert!(image_difference(&peeled, &traced).unwrap() < 0.02);
    }
}
