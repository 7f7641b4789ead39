//! Offscreen color targets and PNG capture.
//!
//! [`CaptureTarget`] is the color attachment headless runs render into. After
//! a frame it is copied into a host-visible buffer and written out with
//! [`save_png`].

use std::path::{Path, PathBuf};

use ash::vk;
use gpu_allocator::MemoryLocation;
use image::{ImageBuffer, Rgba};
use multivol_gpu::{Access, ColorTarget, CommandRecorder, GpuAllocator, GpuBuffer, ImageBarrier};
use thiserror::Error;

use crate::error::Result;
use crate::resources::{clear_float, Texture, TextureDesc};

/// Format of capture targets. Four bytes per pixel, read back as RGBA8.
pub const CAPTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const HOST_READ: Access = Access::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ);

/// Errors writing a captured frame.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Captured {actual} bytes, expected {expected} for {width}x{height} RGBA8")]
    InvalidImageData {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to save capture: {0}")]
    SaveFailed(#[from] image::ImageError),
}

/// Expand `{}` in `pattern` to the frame number.
pub fn capture_path(pattern: &str, frame: u64) -> PathBuf {
    PathBuf::from(pattern.replace("{}", &frame.to_string()))
}

/// Write tightly packed RGBA8 pixels to `path`, format chosen by extension.
pub fn save_png(
    data: Vec<u8>,
    width: u32,
    height: u32,
    path: impl AsRef<Path>,
) -> std::result::Result<(), CaptureError> {
    let path = path.as_ref();
    let expected = width as usize * height as usize * 4;
    let actual = data.len();
    let image = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data).ok_or(
        CaptureError::InvalidImageData {
            width,
            height,
            expected,
            actual,
        },
    )?;
    image.save(path)?;

    tracing::info!(path = %path.display(), width, height, "saved capture");
    Ok(())
}

/// A color attachment with a host-visible readback buffer.
pub struct CaptureTarget {
    texture: Texture,
    readback: GpuBuffer,
    width: u32,
    height: u32,
}

impl CaptureTarget {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let desc = TextureDesc {
            name: "capture_target",
            view_type: vk::ImageViewType::TYPE_2D,
            format: CAPTURE_FORMAT,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            layers: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            clear: None,
        };
        let mut texture = Texture::new(device, allocator, &desc)?;
        let readback = match allocator.create_buffer(
            u64::from(width) * u64::from(height) * 4,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "capture_readback",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                texture.destroy(device, allocator)?;
                return Err(e.into());
            }
        };
        Ok(Self {
            texture,
            readback,
            width,
            height,
        })
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The attachment as the ray caster's resolve target.
    pub const fn color_target(&self) -> ColorTarget {
        ColorTarget {
            view: self.texture.view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    /// Clear to `color` and leave the image in `COLOR_ATTACHMENT_OPTIMAL`.
    pub fn record_clear<R: CommandRecorder + ?Sized>(&self, recorder: &mut R, color: [f32; 4]) {
        let image = self.texture.image.image;
        let range = self.texture.image.color_range();
        recorder.image_barrier(&ImageBarrier {
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src: Access::COLOR_WRITE.and(Access::TRANSFER_READ),
            dst: Access::TRANSFER_WRITE,
            range,
        });
        recorder.clear_color_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            clear_float(color),
            range,
        );
        recorder.image_barrier(&ImageBarrier {
            image,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src: Access::TRANSFER_WRITE,
            dst: Access::COLOR_WRITE,
            range,
        });
    }

    /// Copy the rendered image into the readback buffer.
    pub fn record_readback<R: CommandRecorder + ?Sized>(&self, recorder: &mut R) {
        let image = self.texture.image.image;
        recorder.image_barrier(&ImageBarrier {
            image,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src: Access::COLOR_WRITE,
            dst: Access::TRANSFER_READ,
            range: self.texture.image.color_range(),
        });
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(self.texture.image.extent);
        recorder.copy_image_to_buffer(
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.readback.buffer,
            &[region],
        );
        recorder.memory_barrier(Access::TRANSFER_WRITE, HOST_READ);
    }

    /// RGBA8 pixels of the last readback. The submission must have completed.
    pub fn read_pixels(&self) -> Result<Vec<u8>> {
        Ok(self.readback.read_bytes(0, self.readback.size as usize)?)
    }

    /// # Safety
    /// The image and buffer must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        self.texture.destroy(device, allocator)?;
        allocator.free_buffer(&mut self.readback)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_path_expands_frame_number() {
        assert_eq!(capture_path("out_{}.png", 7), PathBuf::from("out_7.png"));
        assert_eq!(capture_path("out.png", 7), PathBuf::from("out.png"));
    }

    #[test]
    fn short_pixel_data_is_rejected() {
        let err = save_png(vec![0; 15], 2, 2, "unused.png").unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidImageData {
                expected: 16,
                actual: 15,
                ..
            }
        ));
    }

    #[test]
    fn png_round_trips_through_image() {
        let path = std::env::temp_dir().join(format!("multivol_capture_{}.png", std::process::id()));
        let pixels = vec![255, 0, 0, 255, 0, 255, 0, 128];
        save_png(pixels.clone(), 2, 1, &path).unwrap();

        let loaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(loaded.dimensions(), (2, 1));
        assert_eq!(loaded.into_raw(), pixels);
        std::fs::remove_file(&path).unwrap();
    }
}
