//! Volume sources: file uploads and the passes that fill volume textures.
//!
//! Each source slot owns at most one uploaded file image. Filling the
//! renderer-owned volume texture is a separate compute pass, so a slot can be
//! re-initialized without touching the file again.

use std::path::Path;

use ash::vk;
use multivol_core::{VolumeFormat, VolumeTexture};
use multivol_gpu::{Access, CommandRecorder, GpuAllocator, GpuBuffer, ImageBarrier};
use multivol_shaders::VOXEL_GROUP_SIZE;

use crate::error::{RenderError, Result};
use crate::gpu_types::{InitPushConstants, LoadPushConstants};
use crate::resources::{Texture, TextureDesc};

/// Vulkan format sampled for a volume file format.
pub const fn vk_format(format: VolumeFormat) -> vk::Format {
    match format {
        VolumeFormat::R8Unorm => vk::Format::R8_UNORM,
        VolumeFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        VolumeFormat::R16Float => vk::Format::R16_SFLOAT,
        VolumeFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        VolumeFormat::R32Float => vk::Format::R32_SFLOAT,
    }
}

/// Workgroups covering a cube of `size` texels per edge.
pub const fn voxel_group_count(size: u32) -> u32 {
    size.div_ceil(VOXEL_GROUP_SIZE)
}

/// Read and decode a volume file, checking it against the device limit.
///
/// Failures are reported as [`RenderError::VolumeLoad`] and leave no GPU state behind.
pub fn decode_volume_file(index: u32, path: &Path, max_extent: u32) -> Result<VolumeTexture> {
    let load_error = |source| RenderError::VolumeLoad {
        index,
        path: path.display().to_string(),
        source,
    };
    let texture = VolumeTexture::load(path).map_err(load_error)?;
    let largest = texture.width.max(texture.height).max(texture.depth);
    if largest > max_extent {
        return Err(load_error(multivol_core::Error::OutOfBounds(format!(
            "{}x{}x{} exceeds the device limit of {max_extent}",
            texture.width, texture.height, texture.depth
        ))));
    }
    Ok(texture)
}

/// What a slot's volume texture is filled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Procedural cloud.
    Placeholder,
    /// An uploaded file with this many channels.
    File { channel_count: u32 },
}

struct SourceSlot {
    file: Option<Texture>,
    kind: SourceKind,
    /// The volume texture does not reflect `kind` yet.
    pending: bool,
}

/// File images and fill state of every volume source.
pub struct VolumeSources {
    slots: Vec<SourceSlot>,
    /// Replaced file images; a recorded copy may still reference them.
    retired: Vec<Texture>,
}

impl VolumeSources {
    /// `count` slots, each waiting for its placeholder fill.
    pub fn new(count: u32) -> Self {
        let slots = (0..count)
            .map(|_| SourceSlot {
                file: None,
                kind: SourceKind::Placeholder,
                pending: true,
            })
            .collect();
        Self {
            slots,
            retired: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn check_index(&self, index: u32) -> Result<usize> {
        if (index as usize) < self.slots.len() {
            Ok(index as usize)
        } else {
            Err(RenderError::InvalidVolumeIndex {
                index,
                count: self.slots.len() as u32,
            })
        }
    }

    pub fn kind(&self, index: u32) -> Result<SourceKind> {
        Ok(self.slots[self.check_index(index)?].kind)
    }

    /// Whether the slot still needs its fill pass recorded.
    pub fn is_pending(&self, index: u32) -> Result<bool> {
        Ok(self.slots[self.check_index(index)?].pending)
    }

    /// View of the slot's file image, if a file has been uploaded.
    pub fn file_view(&self, index: u32) -> Result<Option<vk::ImageView>> {
        Ok(self.slots[self.check_index(index)?]
            .file
            .as_ref()
            .map(|file| file.view))
    }

    /// Upload `texture` into a new file image for slot `index`.
    ///
    /// Records the copy and returns the staging buffer, which must outlive
    /// the recorded commands. The slot is marked for a fill pass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn stage_upload<R: CommandRecorder + ?Sized>(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        recorder: &mut R,
        index: u32,
        texture: &VolumeTexture,
    ) -> Result<GpuBuffer> {
        let slot = self.check_index(index)?;
        let name = format!("volume_file_{index}");
        let extent = vk::Extent3D {
            width: texture.width,
            height: texture.height,
            depth: texture.depth,
        };
        let desc = TextureDesc::volume_extent(&name, vk_format(texture.format), extent)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let mut staging = allocator.create_buffer_with_data(
            &texture.data,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &format!("volume_upload_{index}"),
        )?;
        let file = match Texture::new(device, allocator, &desc) {
            Ok(file) => file,
            Err(e) => {
                allocator.free_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let range = file.image.color_range();
        recorder.image_barrier(&ImageBarrier {
            image: file.image.image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src: Access::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
            dst: Access::TRANSFER_WRITE,
            range,
        });
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(extent);
        recorder.copy_buffer_to_image(
            staging.buffer,
            file.image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        recorder.image_barrier(&ImageBarrier {
            image: file.image.image,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: file.layout,
            src: Access::TRANSFER_WRITE,
            dst: Access::COMPUTE_READ,
            range,
        });

        let slot = &mut self.slots[slot];
        if let Some(old) = slot.file.replace(file) {
            self.retired.push(old);
        }
        slot.kind = SourceKind::File {
            channel_count: texture.format.channel_count(),
        };
        slot.pending = true;

        tracing::info!(
            index,
            width = texture.width,
            height = texture.height,
            depth = texture.depth,
            format = ?texture.format,
            "staged volume upload"
        );
        Ok(staging)
    }

    /// Record the fill pass of slot `index` into `target`.
    ///
    /// `load` and `init` must use a layout whose set 0 is the slot's
    /// `init_set`. `consumers` is the access scope of the passes that sample
    /// the volume afterwards.
    pub fn record_fill<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &mut R,
        passes: &FillPasses,
        index: u32,
        target: &Texture,
        consumers: Access,
    ) -> Result<()> {
        let slot = self.check_index(index)?;
        let kind = self.slots[slot].kind;
        let (pipeline, layout, push) = match kind {
            SourceKind::File { channel_count } => (
                passes.load_pipeline,
                passes.load_layout,
                bytemuck::bytes_of(&LoadPushConstants { channel_count }).to_vec(),
            ),
            SourceKind::Placeholder => (
                passes.init_pipeline,
                passes.init_layout,
                bytemuck::bytes_of(&InitPushConstants { seed: index }).to_vec(),
            ),
        };

        recorder.memory_barrier(consumers, Access::COMPUTE_WRITE);
        recorder.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline);
        recorder.bind_descriptor_sets(
            vk::PipelineBindPoint::COMPUTE,
            layout,
            0,
            &[passes.init_sets[slot]],
        );
        recorder.push_constants(layout, vk::ShaderStageFlags::COMPUTE, 0, &push);
        let extent = target.image.extent;
        recorder.dispatch(
            voxel_group_count(extent.width),
            voxel_group_count(extent.height),
            voxel_group_count(extent.depth),
        );
        recorder.memory_barrier(Access::COMPUTE_WRITE, consumers);

        self.slots[slot].pending = false;
        tracing::debug!(index, ?kind, "recorded volume fill");
        Ok(())
    }

    /// Indices of slots whose fill pass is still outstanding.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pending)
            .map(|(i, _)| i as u32)
    }

    /// # Safety
    /// No file image may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(mut file) = slot.file.take() {
                file.destroy(device, allocator)?;
            }
        }
        for mut file in self.retired.drain(..) {
            file.destroy(device, allocator)?;
        }
        Ok(())
    }
}

/// Pipelines and sets used by [`VolumeSources::record_fill`].
#[derive(Clone, Debug)]
pub struct FillPasses {
    pub load_pipeline: vk::Pipeline,
    pub load_layout: vk::PipelineLayout,
    pub init_pipeline: vk::Pipeline,
    pub init_layout: vk::PipelineLayout,
    /// One set per source slot.
    pub init_sets: Vec<vk::DescriptorSet>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn formats_map_to_sampled_vulkan_formats() {
        assert_eq!(vk_format(VolumeFormat::R8Unorm), vk::Format::R8_UNORM);
        assert_eq!(
            vk_format(VolumeFormat::Rgba16Float),
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert_eq!(vk_format(VolumeFormat::R32Float), vk::Format::R32_SFLOAT);
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(voxel_group_count(1), 1);
        assert_eq!(voxel_group_count(4), 1);
        assert_eq!(voxel_group_count(5), 2);
        assert_eq!(voxel_group_count(128), 32);
    }

    #[test]
    fn slots_start_as_pending_placeholders() {
        let sources = VolumeSources::new(3);
        assert_eq!(sources.len(), 3);
        assert_eq!(sources.kind(2).unwrap(), SourceKind::Placeholder);
        assert_eq!(sources.pending().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(sources.is_pending(1).unwrap());
        assert!(sources.is_pending(3).is_err());
        assert!(sources.file_view(0).unwrap().is_none());
        assert!(matches!(
            sources.kind(3),
            Err(RenderError::InvalidVolumeIndex { index: 3, count: 3 })
        ));
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = decode_volume_file(1, Path::new("does/not/exist.dds"), 2048).unwrap_err();
        assert!(matches!(
            err,
            RenderError::VolumeLoad {
                index: 1,
                source: multivol_core::Error::Io(_),
                ..
            }
        ));
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        let path = std::env::temp_dir().join(format!("multivol_bad_{}.dds", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a volume")
            .unwrap();
        let err = decode_volume_file(0, &path, 2048).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err,
            RenderError::VolumeLoad {
                source: multivol_core::Error::InvalidData(_),
                ..
            }
        ));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let texture = VolumeTexture::new(8, 4, 4, VolumeFormat::R8Unorm, vec![0; 128]).unwrap();
        let path = std::env::temp_dir().join(format!("multivol_big_{}.dds", std::process::id()));
        std::fs::write(&path, texture.to_dds_bytes()).unwrap();
        let err = decode_volume_file(0, &path, 4).unwrap_err();
        let ok = decode_volume_file(0, &path, 8);
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err,
            RenderError::VolumeLoad {
                source: multivol_core::Error::OutOfBounds(_),
                ..
            }
        ));
        assert_eq!(ok.unwrap(), texture);
    }
}
