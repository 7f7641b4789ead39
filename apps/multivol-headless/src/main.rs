//! Offscreen renderer for the multi-volume ray caster.
//!
//! Renders `--frames` frames of a slowly orbiting camera and writes the last
//! one to a PNG.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p multivol-headless -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::Context;
use ash::vk;
use glam::{Mat4, Vec3};
use multivol_core::{FrameIndex, FrameRing, FRAME_COUNT};
use multivol_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use multivol_gpu::{CommandPool, FrameFences, GpuContext, GpuContextBuilder, VulkanRecorder};
use multivol_render::{
    save_png, Camera, CaptureTarget, MultiRayCaster, RenderSettings, CAPTURE_FORMAT,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Radians the camera orbits per frame.
const ORBIT_STEP: f32 = 0.02;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = RenderSettings::from_args().context("invalid arguments")?;
    let context = GpuContextBuilder::new()
        .app_name("multivol-headless")
        .build()
        .context("failed to create GPU context")?;

    let mut run = Run::new(&context, &settings)?;
    let result = run.render_all(&context, &settings);
    // SAFETY: every object was created from `context`.
    unsafe { run.destroy(&context)? };
    result
}

/// GPU objects of one headless run.
struct Run {
    caster: MultiRayCaster,
    target: CaptureTarget,
    pool: CommandPool,
    command_buffers: FrameRing<vk::CommandBuffer>,
    fences: FrameFences,
}

impl Run {
    fn new(ctx: &GpuContext, settings: &RenderSettings) -> anyhow::Result<Self> {
        let device = ctx.device();
        let (width, height) = (settings.width, settings.height);

        let pool = unsafe {
            CommandPool::new(
                device,
                ctx.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let buffers = unsafe {
            pool.allocate_command_buffers(device, vk::CommandBufferLevel::PRIMARY, FRAME_COUNT as u32)?
        };
        let fences = unsafe { FrameFences::new(device)? };
        let target = unsafe { CaptureTarget::new(device, &mut ctx.allocator().lock(), width, height)? };

        let mut caster = unsafe { MultiRayCaster::new(ctx, settings.ray_caster_config(CAPTURE_FORMAT)) }
            .context("failed to create ray caster")?;
        caster.set_viewport(ctx, width, height)?;
        caster.set_max_samples(settings.max_ray_samples, settings.max_light_samples);
        let [x, y, z, spacing] = settings.volume_pos_scale;
        let center = Vec3::new(x, y, z);
        caster.set_volumes_world(spacing, center);
        caster.set_light_map_world(settings.light_map_scale, center);
        caster.set_light(center + light_offset(), Vec3::ONE, 1.0);
        caster.set_ambient(Vec3::new(0.6, 0.7, 1.0), 0.15);

        info!(
            width,
            height,
            volumes = settings.num_volumes,
            files = settings.volume_files.len(),
            oit = caster.oit_method().name(),
            "headless run ready"
        );

        Ok(Self {
            caster,
            target,
            pool,
            command_buffers: FrameRing::from_fn(|i| buffers[i]),
            fences,
        })
    }

    /// Upload every volume file, waiting for the copies to finish.
    fn load_volumes(&mut self, ctx: &GpuContext, settings: &RenderSettings) -> anyhow::Result<()> {
        if settings.volume_files.is_empty() {
            return Ok(());
        }
        let device = ctx.device();
        let cmd = self.command_buffers[FrameIndex::default()];
        unsafe {
            self.fences.acquire(device, FrameIndex::default())?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            let mut recorder = VulkanRecorder::new(device, ctx.ray_tracing(), cmd);
            for (i, path) in settings.volume_files.iter().enumerate() {
                self.caster
                    .load_volume_data(ctx, &mut recorder, i as u32, path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                self.caster.init_volume_data(&mut recorder, i as u32)?;
            }
            end_command_buffer(device, cmd)?;
            submit_command_buffers(
                device,
                ctx.graphics_queue(),
                &[cmd],
                self.fences.fence(FrameIndex::default()),
            )?;
            self.fences.wait_all(device)?;
        }
        Ok(())
    }

    fn render_all(&mut self, ctx: &GpuContext, settings: &RenderSettings) -> anyhow::Result<()> {
        self.load_volumes(ctx, settings)?;

        let device = ctx.device();
        let [x, y, z, spacing] = settings.volume_pos_scale;
        let center = Vec3::new(x, y, z);
        let radius = (settings.num_volumes as f32).cbrt().ceil() * spacing * 1.8;
        let aspect = settings.width as f32 / settings.height as f32;
        let shadow = Mat4::orthographic_rh(-16.0, 16.0, -16.0, 16.0, 0.1, 64.0)
            * Mat4::look_at_rh(center + light_offset(), center, Vec3::Y);

        let mut frame = FrameIndex::default();
        for n in 0..settings.frames {
            let camera = Camera::orbit(center, radius, n as f32 * ORBIT_STEP, 0.35, aspect);
            let view = camera.frame_view(shadow);
            let cmd = self.command_buffers[frame];

            unsafe {
                self.fences.acquire(device, frame)?;
                self.caster.update_frame(ctx, frame.get(), &view)?;

                device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
                begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
                let mut recorder = VulkanRecorder::new(device, ctx.ray_tracing(), cmd);
                self.target.record_clear(&mut recorder, settings.clear_color);
                // Static light: propagate on the first frame only.
                self.caster.render(
                    ctx,
                    &mut recorder,
                    frame.get(),
                    self.target.color_target(),
                    n == 0,
                )?;
                self.target.record_readback(&mut recorder);
                end_command_buffer(device, cmd)?;
                submit_command_buffers(device, ctx.graphics_queue(), &[cmd], self.fences.fence(frame))?;
            }
            frame = frame.next();
        }

        unsafe { self.fences.wait_all(device)? };
        if let Ok(visibility) = self.caster.read_visibility() {
            info!(visible = visibility.visible_count, "last frame culled");
        }

        let (width, height) = self.target.dimensions();
        let pixels = self.target.read_pixels()?;
        save_png(pixels, width, height, &settings.output)
            .with_context(|| format!("failed to write {}", settings.output.display()))?;
        Ok(())
    }

    /// # Safety
    /// `ctx` must be the context every object was created with.
    unsafe fn destroy(mut self, ctx: &GpuContext) -> anyhow::Result<()> {
        let device = ctx.device();
        self.fences.wait_all(device)?;
        self.caster.destroy(ctx)?;
        self.target.destroy(device, &mut ctx.allocator().lock())?;
        self.fences.destroy(device);
        self.pool.destroy(device);
        Ok(())
    }
}

fn light_offset() -> Vec3 {
    Vec3::new(4.0, 10.0, 6.0)
}

fn print_help() {
    eprintln!(
        "Multi-volume ray caster, offscreen

USAGE:
    cargo run -p multivol-headless -- [OPTIONS]

OPTIONS:
    --grid-size <N>          Cube map face resolution (default: 128)
    --light-grid-size <N>    Light volume resolution (default: 64)
    --max-ray-samples <N>    Samples per view ray (default: 256)
    --max-light-samples <N>  Samples per light ray (default: 64)
    --volumes <N>            Number of volume instances (default: 8)
    --volume <PATH>          DDS volume file, repeatable up to 10 times
    --oit <peel|rt>          Layer strategy (default: peel)
    --width <N>              Output width (default: 1280)
    --height <N>             Output height (default: 720)
    --frames <N>             Frames to render (default: 3)
    --output <PATH>          PNG written after the last frame (default: multivol.png)
    -h, --help               Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                 Set log level (e.g., info, debug, trace)"
    );
}
