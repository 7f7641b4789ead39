//! GPU buffers, images, and samplers owned by the ray caster.

use ash::vk;
use gpu_allocator::MemoryLocation;
use multivol_core::constants::OIT_LAYER_COUNT;
use multivol_core::{FrameIndex, FrameRing};
use multivol_gpu::{Access, CommandRecorder, GpuAllocator, GpuBuffer, GpuImage, ImageBarrier};

use crate::config::RayCasterConfig;
use crate::culling::CULLED_LOD;
use crate::error::Result;
use crate::gpu_types::{CbPerFrame, CounterReset, PerObject, VolumeDesc, CUBE_INDICES};
use crate::oit::EMPTY_KEY;

/// Format of every renderer-written color image.
pub const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
/// Format of the cube map first-hit distances.
pub const CUBE_DEPTH_FORMAT: vk::Format = vk::Format::R32_SFLOAT;
/// Format of the layer keys.
pub const KEY_FORMAT: vk::Format = vk::Format::R32_UINT;
/// Format of the placeholder depth maps.
pub const PLACEHOLDER_DEPTH_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

const TOP_OF_PIPE: Access = Access::new(
    vk::PipelineStageFlags2::TOP_OF_PIPE,
    vk::AccessFlags2::NONE,
);

/// Shape of an image and its default view.
#[derive(Clone, Copy)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
    /// Layout the image rests in between passes.
    pub layout: vk::ImageLayout,
    /// Value written once before first use.
    pub clear: Option<vk::ClearColorValue>,
}

impl<'a> TextureDesc<'a> {
    /// A cubic 3D texture of `size` texels per edge.
    pub fn volume(name: &'a str, format: vk::Format, size: u32) -> Self {
        Self::volume_extent(
            name,
            format,
            vk::Extent3D {
                width: size,
                height: size,
                depth: size,
            },
        )
    }

    pub fn volume_extent(name: &'a str, format: vk::Format, extent: vk::Extent3D) -> Self {
        Self {
            name,
            view_type: vk::ImageViewType::TYPE_3D,
            format,
            extent,
            layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            layout: vk::ImageLayout::GENERAL,
            clear: None,
        }
    }

    /// A 2D array of `layers` images of `width x height`.
    pub fn layered(name: &'a str, format: vk::Format, width: u32, height: u32, layers: u32) -> Self {
        Self {
            name,
            view_type: vk::ImageViewType::TYPE_2D_ARRAY,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            layers,
            usage: vk::ImageUsageFlags::STORAGE,
            layout: vk::ImageLayout::GENERAL,
            clear: None,
        }
    }

    /// A single-texel 2D image sampled as a stand-in for a missing input.
    pub fn placeholder(name: &'a str, format: vk::Format, view_type: vk::ImageViewType) -> Self {
        let layers = if view_type == vk::ImageViewType::CUBE { 6 } else { 1 };
        Self {
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED,
            view_type,
            ..Self::layered(name, format, 1, 1, layers)
        }
    }

    #[must_use]
    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    #[must_use]
    pub fn layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn clear(mut self, value: vk::ClearColorValue) -> Self {
        self.clear = Some(value);
        self.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        self
    }

    fn image_info(&self) -> vk::ImageCreateInfo<'static> {
        let (image_type, flags) = match self.view_type {
            vk::ImageViewType::TYPE_3D => (vk::ImageType::TYPE_3D, vk::ImageCreateFlags::empty()),
            vk::ImageViewType::CUBE => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::CUBE_COMPATIBLE),
            _ => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::empty()),
        };
        vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(1)
            .array_layers(self.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// An image, its default view, and whether its first-use setup has been recorded.
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    clear: Option<vk::ClearColorValue>,
    ready: bool,
}

impl Texture {
    /// Create the image and its view.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        desc: &TextureDesc<'_>,
    ) -> Result<Self> {
        let mut image = allocator.create_image(&desc.image_info(), MemoryLocation::GpuOnly, desc.name)?;
        let view = match image.create_view(device, desc.view_type, desc.format) {
            Ok(view) => view,
            Err(e) => {
                allocator.free_image(&mut image)?;
                return Err(e.into());
            }
        };
        Ok(Self {
            image,
            view,
            layout: desc.layout,
            clear: desc.clear,
            ready: false,
        })
    }

    /// Record the transition out of `UNDEFINED` and the initial clear, once.
    ///
    /// `consumers` is the access scope of the passes that use the image next.
    pub fn record_init<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R, consumers: Access) {
        if self.ready {
            return;
        }
        let range = self.image.color_range();
        let (first_layout, first_dst) = if self.clear.is_some() {
            (vk::ImageLayout::GENERAL, Access::TRANSFER_WRITE)
        } else {
            (self.layout, consumers)
        };
        recorder.image_barrier(&ImageBarrier {
            image: self.image.image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: first_layout,
            src: TOP_OF_PIPE,
            dst: first_dst,
            range,
        });
        if let Some(value) = self.clear {
            recorder.clear_color_image(self.image.image, vk::ImageLayout::GENERAL, value, range);
            recorder.image_barrier(&ImageBarrier {
                image: self.image.image,
                old_layout: vk::ImageLayout::GENERAL,
                new_layout: self.layout,
                src: Access::TRANSFER_WRITE,
                dst: consumers,
                range,
            });
        }
        self.ready = true;
    }

    /// Destroy the view and free the image.
    ///
    /// # Safety
    /// The image must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        device.destroy_image_view(self.view, None);
        self.view = vk::ImageView::null();
        allocator.free_image(&mut self.image)?;
        Ok(())
    }
}

pub fn clear_float(value: [f32; 4]) -> vk::ClearColorValue {
    vk::ClearColorValue { float32: value }
}

/// Clear value of an empty layer key.
pub fn clear_empty_key() -> vk::ClearColorValue {
    vk::ClearColorValue {
        uint32: [EMPTY_KEY; 4],
    }
}

/// Buffers of the culling and march passes.
pub struct CasterBuffers {
    /// `CbPerFrame`, one per frame slot.
    pub per_frame: FrameRing<GpuBuffer>,
    /// `PerObject[num_volumes]`, one per frame slot.
    pub per_object: FrameRing<GpuBuffer>,
    pub volume_descs: GpuBuffer,
    pub visible: GpuBuffer,
    /// Visible volume counter, host-readable after the frame retires.
    pub counter: GpuBuffer,
    pub dispatch_args: GpuBuffer,
    pub draw_args: GpuBuffer,
    /// Per-volume level of detail, host-readable after the frame retires.
    pub volume_vis: GpuBuffer,
    pub counter_reset: GpuBuffer,
    pub cube_indices: GpuBuffer,
}

impl CasterBuffers {
    /// Allocate every buffer for `config`.
    pub fn new(allocator: &mut GpuAllocator, config: &RayCasterConfig) -> Result<Self> {
        let n = u64::from(config.num_volumes);
        let word = std::mem::size_of::<u32>() as u64;
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let indirect = storage
            | vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST;

        let per_frame = FrameRing::try_from_fn_in(
            allocator,
            |allocator, i| {
                allocator.create_buffer(
                    CbPerFrame::SIZE,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                    &format!("cb_per_frame_{i}"),
                )
            },
            release,
        )?;
        let per_object = FrameRing::try_from_fn_in(
            allocator,
            |allocator, i| {
                allocator.create_buffer(
                    PerObject::SIZE * n,
                    storage,
                    MemoryLocation::CpuToGpu,
                    &format!("per_object_{i}"),
                )
            },
            release,
        )?;

        let descs: Vec<VolumeDesc> = (0..config.num_volumes)
            .map(|i| VolumeDesc::new(i, config.source_index(i)))
            .collect();
        let volume_descs =
            allocator.create_buffer_with_data(bytemuck::cast_slice(&descs), storage, "volume_descs")?;

        let visible = allocator.create_buffer(word * n, storage, MemoryLocation::GpuOnly, "visible_volumes")?;
        let counter = allocator.create_buffer(
            word,
            storage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "visible_count",
        )?;
        let dispatch_args = allocator.create_buffer(
            std::mem::size_of::<crate::gpu_types::DispatchArgs>() as u64,
            indirect,
            MemoryLocation::GpuOnly,
            "dispatch_args",
        )?;
        let draw_args = allocator.create_buffer(
            u64::from(crate::gpu_types::DrawIndexedArgs::SIZE),
            indirect,
            MemoryLocation::GpuOnly,
            "draw_args",
        )?;
        let volume_vis = allocator.create_buffer_with_data(
            bytemuck::cast_slice(&vec![CULLED_LOD; config.num_volumes as usize]),
            storage,
            "volume_vis",
        )?;
        let counter_reset = allocator.create_buffer_with_data(
            bytemuck::bytes_of(&CounterReset::new(config.grid_size)),
            vk::BufferUsageFlags::TRANSFER_SRC,
            "counter_reset",
        )?;
        let cube_indices = allocator.create_buffer_with_data(
            bytemuck::cast_slice(&CUBE_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "cube_indices",
        )?;

        Ok(Self {
            per_frame,
            per_object,
            volume_descs,
            visible,
            counter,
            dispatch_args,
            draw_args,
            volume_vis,
            counter_reset,
            cube_indices,
        })
    }

    /// Write the frame slot's constants and per-volume transforms.
    pub fn write_frame(&mut self, frame: FrameIndex, cb: &CbPerFrame, objects: &[PerObject]) -> Result<()> {
        self.per_frame[frame].write_pod(0, std::slice::from_ref(cb))?;
        self.per_object[frame].write_pod(0, objects)?;
        Ok(())
    }

    /// Visible count and per-volume levels of detail left by the last cull.
    ///
    /// Only meaningful once the GPU has retired that frame.
    pub fn read_visibility(&self, num_volumes: u32) -> Result<GpuVisibility> {
        let count = self.counter.read_bytes(0, std::mem::size_of::<u32>())?;
        let lods = self
            .volume_vis
            .read_bytes(0, num_volumes as usize * std::mem::size_of::<u32>())?;
        Ok(GpuVisibility {
            visible_count: bytemuck::pod_read_unaligned(&count),
            lods: bytemuck::pod_collect_to_vec(&lods),
        })
    }

    pub fn destroy(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        for buffer in self.per_frame.iter_mut().chain(self.per_object.iter_mut()) {
            allocator.free_buffer(buffer)?;
        }
        for buffer in [
            &mut self.volume_descs,
            &mut self.visible,
            &mut self.counter,
            &mut self.dispatch_args,
            &mut self.draw_args,
            &mut self.volume_vis,
            &mut self.counter_reset,
            &mut self.cube_indices,
        ] {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

fn release(allocator: &mut GpuAllocator, mut buffer: GpuBuffer) {
    if let Err(e) = allocator.free_buffer(&mut buffer) {
        tracing::warn!("failed to release buffer: {e}");
    }
}

/// Culling results read back from the GPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuVisibility {
    pub visible_count: u32,
    /// Per-volume level of detail, `CULLED_LOD` when culled.
    pub lods: Vec<u32>,
}

impl GpuVisibility {
    /// Indices of the volumes that passed the cull.
    pub fn visible(&self) -> Vec<u32> {
        self.lods
            .iter()
            .enumerate()
            .filter(|(_, &lod)| lod != CULLED_LOD)
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// Images of the light, march, and layer passes.
pub struct CasterImages {
    /// One renderer-owned volume texture per source.
    pub volumes: Vec<Texture>,
    pub light_map: Texture,
    pub cube_maps: Texture,
    pub cube_depths: Texture,
    pub k_depths: Texture,
    pub k_colors: Texture,
    /// Read as "nothing in front" until real depth maps are set.
    pub placeholder_depth: Texture,
    /// Black probe used until an irradiance map is set.
    pub placeholder_irradiance: Texture,
}

impl CasterImages {
    /// Create every image for `config` and a `width x height` viewport.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        config: &RayCasterConfig,
        viewport: [u32; 2],
    ) -> Result<Self> {
        let zero = clear_float([0.0; 4]);
        let mut volumes = Vec::with_capacity(config.num_volume_srcs as usize);
        for i in 0..config.num_volume_srcs {
            let name = format!("volume_{i}");
            let desc = TextureDesc::volume(&name, COLOR_FORMAT, config.volume_resolution)
                .usage(vk::ImageUsageFlags::STORAGE)
                .clear(zero);
            volumes.push(Texture::new(device, allocator, &desc)?);
        }

        let light_map = Texture::new(
            device,
            allocator,
            &TextureDesc::volume("light_map", COLOR_FORMAT, config.light_grid_size)
                .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
                .clear(zero),
        )?;

        let layers = config.cube_layers();
        let cube_maps = Texture::new(
            device,
            allocator,
            &TextureDesc::layered("cube_maps", COLOR_FORMAT, config.grid_size, config.grid_size, layers)
                .usage(vk::ImageUsageFlags::SAMPLED)
                .clear(zero),
        )?;
        let cube_depths = Texture::new(
            device,
            allocator,
            &TextureDesc::layered(
                "cube_depths",
                CUBE_DEPTH_FORMAT,
                config.grid_size,
                config.grid_size,
                layers,
            )
            .clear(clear_float([-1.0; 4])),
        )?;

        let (k_depths, k_colors) = Self::create_layers(device, allocator, viewport)?;

        let placeholder_depth = Texture::new(
            device,
            allocator,
            &TextureDesc::placeholder(
                "placeholder_depth",
                PLACEHOLDER_DEPTH_FORMAT,
                vk::ImageViewType::TYPE_2D,
            )
            .clear(clear_float([1.0; 4])),
        )?;
        let placeholder_irradiance = Texture::new(
            device,
            allocator,
            &TextureDesc::placeholder("placeholder_irradiance", COLOR_FORMAT, vk::ImageViewType::CUBE)
                .clear(zero),
        )?;

        tracing::debug!(
            volumes = volumes.len(),
            volume_resolution = config.volume_resolution,
            light_grid = config.light_grid_size,
            cube_layers = layers,
            viewport = ?viewport,
            "created ray caster images"
        );

        Ok(Self {
            volumes,
            light_map,
            cube_maps,
            cube_depths,
            k_depths,
            k_colors,
            placeholder_depth,
            placeholder_irradiance,
        })
    }

    unsafe fn create_layers(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        viewport: [u32; 2],
    ) -> Result<(Texture, Texture)> {
        let [width, height] = viewport;
        let k_depths = Texture::new(
            device,
            allocator,
            &TextureDesc::layered("k_depths", KEY_FORMAT, width, height, OIT_LAYER_COUNT)
                .clear(clear_empty_key()),
        )?;
        let k_colors = Texture::new(
            device,
            allocator,
            &TextureDesc::layered("k_colors", COLOR_FORMAT, width, height, OIT_LAYER_COUNT)
                .clear(clear_float([0.0; 4])),
        )?;
        Ok((k_depths, k_colors))
    }

    /// Size of the layer images.
    pub const fn layer_extent(&self) -> [u32; 2] {
        [self.k_depths.image.extent.width, self.k_depths.image.extent.height]
    }

    /// Replace the layer images with ones sized for `viewport`.
    ///
    /// # Safety
    /// The old layer images must not be in use.
    pub unsafe fn resize_layers(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        viewport: [u32; 2],
    ) -> Result<()> {
        let (k_depths, k_colors) = Self::create_layers(device, allocator, viewport)?;
        let mut old_depths = std::mem::replace(&mut self.k_depths, k_depths);
        let mut old_colors = std::mem::replace(&mut self.k_colors, k_colors);
        old_depths.destroy(device, allocator)?;
        old_colors.destroy(device, allocator)?;
        Ok(())
    }

    /// Record first-use setup for images that still need it.
    pub fn record_pending_init<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R, consumers: Access) {
        for texture in self.iter_mut() {
            texture.record_init(recorder, consumers);
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Texture> {
        self.volumes.iter_mut().chain([
            &mut self.light_map,
            &mut self.cube_maps,
            &mut self.cube_depths,
            &mut self.k_depths,
            &mut self.k_colors,
            &mut self.placeholder_depth,
            &mut self.placeholder_irradiance,
        ])
    }

    /// # Safety
    /// No image may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for texture in self.iter_mut() {
            texture.destroy(device, allocator)?;
        }
        Ok(())
    }
}

/// Samplers shared by every sampled binding.
#[derive(Clone, Copy, Debug)]
pub struct Samplers {
    /// Trilinear, clamped; volumes, light volume, cube maps, irradiance.
    pub linear: vk::Sampler,
    /// Point, clamped; depth maps.
    pub nearest: vk::Sampler,
}

impl Samplers {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let info = |filter: vk::Filter| {
            vk::SamplerCreateInfo::default()
                .mag_filter(filter)
                .min_filter(filter)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .max_lod(0.0)
        };
        let linear = device.create_sampler(&info(vk::Filter::LINEAR), None)?;
        let nearest = match device.create_sampler(&info(vk::Filter::NEAREST), None) {
            Ok(sampler) => sampler,
            Err(e) => {
                device.destroy_sampler(linear, None);
                return Err(e.into());
            }
        };
        Ok(Self { linear, nearest })
    }

    /// # Safety
    /// The samplers must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_sampler(self.linear, None);
        device.destroy_sampler(self.nearest, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_placeholder_is_six_layers() {
        let desc = TextureDesc::placeholder("irr", COLOR_FORMAT, vk::ImageViewType::CUBE);
        let info = desc.image_info();
        assert_eq!(info.array_layers, 6);
        assert!(info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(desc.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn clear_adds_transfer_usage() {
        let desc = TextureDesc::layered("k", KEY_FORMAT, 8, 8, 4).clear(clear_empty_key());
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(desc.usage.contains(vk::ImageUsageFlags::STORAGE));
        // SAFETY: the union was written through `uint32`.
        assert_eq!(unsafe { desc.clear.unwrap().uint32 }, [u32::MAX; 4]);
    }

    #[test]
    fn volume_textures_are_3d() {
        let info = TextureDesc::volume("v", COLOR_FORMAT, 32).image_info();
        assert_eq!(info.image_type, vk::ImageType::TYPE_3D);
        assert_eq!(info.extent.depth, 32);
        assert_eq!(info.array_layers, 1);
    }

    #[test]
    fn visibility_lists_unculled_volumes() {
        let vis = GpuVisibility {
            visible_count: 2,
            lods: vec![0, CULLED_LOD, 3, CULLED_LOD],
        };
        assert_eq!(vis.visible(), vec![0, 2]);
    }
}
