//! Acceleration structure management for hardware ray tracing.
//!
//! Volumes are procedural geometry: a bottom-level structure holds the proxy
//! AABB (the local unit cube unless the caller supplies other bounds), and
//! the top-level structure carries one instance per volume whose transform is
//! the volume's world matrix. Instances refer to bottom-level structures by
//! [`BlasIndex`] into a table owned by the caller; the table must outlive
//! every top-level build that references it.

use crate::error::{RayTracingError, Result};
use crate::flags::{BuildFlags, GeometryFlags, InstanceFlags};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use multivol_core::{Aabb, FrameIndex, FrameRing};
use multivol_gpu::{Access, CommandRecorder, GpuAllocator, GpuBuffer, RayTracingDevice};

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl From<Aabb> for AabbPositions {
    fn from(aabb: Aabb) -> Self {
        Self {
            min_x: aabb.min.x,
            min_y: aabb.min.y,
            min_z: aabb.min.z,
            max_x: aabb.max.x,
            max_y: aabb.max.y,
            max_z: aabb.max.z,
        }
    }
}

/// Memory requirements of an acceleration structure build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

impl PrebuildInfo {
    /// Scratch space large enough for both a build and an update.
    pub fn max_scratch_size(&self) -> u64 {
        self.scratch_size.max(self.update_scratch_size)
    }
}

impl From<&vk::AccelerationStructureBuildSizesInfoKHR<'_>> for PrebuildInfo {
    fn from(sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }
}

/// How a top-level structure should be brought up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build from scratch.
    Build,
    /// In-place refit of a structure built with `ALLOW_UPDATE`.
    Update,
}

impl BuildMode {
    /// Decide whether a top-level structure needs work this frame.
    ///
    /// The first frame always builds; later frames refit only when an
    /// instance transform changed.
    pub const fn plan(built: bool, transforms_changed: bool, allow_update: bool) -> Option<Self> {
        match (built, transforms_changed) {
            (false, _) => Some(Self::Build),
            (true, true) if allow_update => Some(Self::Update),
            (true, true) => Some(Self::Build),
            (true, false) => None,
        }
    }
}

/// Index of a bottom-level structure in the caller's table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlasIndex(pub u32);

/// Scratch memory shared by acceleration structure builds.
pub struct AccelerationScratch {
    buffer: GpuBuffer,
    address: vk::DeviceAddress,
}

impl AccelerationScratch {
    /// Allocate scratch memory whose device address honors `alignment`.
    pub fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        size: u64,
        alignment: u32,
    ) -> Result<Self> {
        let alignment = u64::from(alignment.max(1));
        let buffer = allocator.create_buffer(
            size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch_buffer",
        )?;
        let address = buffer.device_address(device).next_multiple_of(alignment);
        Ok(Self { buffer, address })
    }

    pub const fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)?;
        Ok(())
    }
}

fn aabb_geometry(
    aabb_address: vk::DeviceAddress,
    flags: GeometryFlags,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::AABBS)
        .flags(flags.to_vk())
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: aabb_address,
                })
                .stride(std::mem::size_of::<AabbPositions>() as u64),
        })
}

fn instance_geometry(
    instance_address: vk::DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                }),
        })
}

unsafe fn query_prebuild(
    rt: &RayTracingDevice,
    ty: vk::AccelerationStructureTypeKHR,
    flags: BuildFlags,
    geometry: &vk::AccelerationStructureGeometryKHR<'_>,
    primitive_count: u32,
) -> PrebuildInfo {
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(flags.to_vk())
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry));

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    rt.acceleration_structure.get_acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        &build_info,
        &[primitive_count],
        &mut sizes,
    );
    PrebuildInfo::from(&sizes)
}

/// Backing buffer plus handle for one acceleration structure.
unsafe fn create_structure(
    rt: &RayTracingDevice,
    allocator: &mut GpuAllocator,
    ty: vk::AccelerationStructureTypeKHR,
    size: u64,
    name: &str,
) -> Result<(vk::AccelerationStructureKHR, GpuBuffer, vk::DeviceAddress)> {
    let mut buffer = allocator.create_buffer(
        size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        name,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .size(size)
        .ty(ty);

    let structure = match rt
        .acceleration_structure
        .create_acceleration_structure(&create_info, None)
    {
        Ok(structure) => structure,
        Err(e) => {
            allocator.free_buffer(&mut buffer)?;
            return Err(e.into());
        }
    };

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(structure);
    let address = rt
        .acceleration_structure
        .get_acceleration_structure_device_address(&address_info);
    Ok((structure, buffer, address))
}

/// Bottom-level acceleration structure over procedural AABBs.
pub struct BottomLevelAs {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    aabb_buffer: GpuBuffer,
    device_address: vk::DeviceAddress,
    primitive_count: u32,
    flags: BuildFlags,
    geometry_flags: GeometryFlags,
    prebuild: PrebuildInfo,
}

impl BottomLevelAs {
    /// Create a BLAS over `aabbs`. The build is recorded separately.
    ///
    /// # Safety
    /// - Device, ray tracing loaders, and allocator must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        aabbs: &[Aabb],
        flags: BuildFlags,
        geometry_flags: GeometryFlags,
    ) -> Result<Self> {
        if aabbs.is_empty() {
            return Err(RayTracingError::InvalidInstance(
                "bottom-level structure needs at least one AABB".to_string(),
            ));
        }

        let positions: Vec<AabbPositions> = aabbs.iter().copied().map(AabbPositions::from).collect();
        let mut aabb_buffer = allocator.create_buffer_with_data(
            bytemuck::cast_slice(&positions),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "blas_aabb_buffer",
        )?;

        let primitive_count = positions.len() as u32;
        let geometry = aabb_geometry(aabb_buffer.device_address(device), geometry_flags);
        let prebuild = query_prebuild(
            rt,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            &geometry,
            primitive_count,
        );

        let (acceleration_structure, buffer, device_address) = match create_structure(
            rt,
            allocator,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            prebuild.result_size,
            "blas_buffer",
        ) {
            Ok(created) => created,
            Err(e) => {
                allocator.free_buffer(&mut aabb_buffer)?;
                return Err(e);
            }
        };

        tracing::debug!(
            primitive_count,
            size = prebuild.result_size,
            "created bottom-level acceleration structure"
        );

        Ok(Self {
            acceleration_structure,
            buffer,
            aabb_buffer,
            device_address,
            primitive_count,
            flags,
            geometry_flags,
            prebuild,
        })
    }

    pub const fn prebuild_info(&self) -> PrebuildInfo {
        self.prebuild
    }

    pub const fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Record the build. The caller orders it before any TLAS build.
    ///
    /// # Safety
    /// `scratch_address` must point to at least `prebuild_info().scratch_size`
    /// bytes that no other in-flight build uses.
    pub unsafe fn record_build<R: CommandRecorder + ?Sized>(
        &self,
        recorder: &mut R,
        device: &ash::Device,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()> {
        let geometry = aabb_geometry(self.aabb_buffer.device_address(device), self.geometry_flags);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.flags.to_vk())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let range =
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.primitive_count);

        recorder.build_acceleration_structures(&[build_info], &[std::slice::from_ref(&range)])?;
        Ok(())
    }

    /// Destroy the BLAS and free resources.
    ///
    /// # Safety
    /// The BLAS must not be in use.
    pub unsafe fn destroy(mut self, rt: &RayTracingDevice, allocator: &mut GpuAllocator) -> Result<()> {
        rt.acceleration_structure
            .destroy_acceleration_structure(self.acceleration_structure, None);
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.aabb_buffer)?;
        Ok(())
    }
}

/// Description of one TLAS instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstanceDesc {
    /// Object-to-world transform; only the upper 3x4 part is used.
    pub transform: Mat4,
    /// Value of `gl_InstanceCustomIndexEXT` (24 bits).
    pub instance_id: u32,
    pub mask: u8,
    /// Hit group record offset (24 bits).
    pub hit_group_offset: u32,
    pub flags: InstanceFlags,
    pub blas: BlasIndex,
}

impl InstanceDesc {
    const MAX_24_BIT: u32 = (1 << 24) - 1;

    /// Instance for volume `index`: visible to every ray, never treated as opaque.
    pub const fn volume(index: u32, world: Mat4, blas: BlasIndex) -> Self {
        Self {
            transform: world,
            instance_id: index,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: InstanceFlags::FORCE_NON_OPAQUE,
            blas,
        }
    }

    /// Encode against the device addresses of the BLAS table.
    pub fn encode(
        &self,
        blas_addresses: &[vk::DeviceAddress],
    ) -> Result<vk::AccelerationStructureInstanceKHR> {
        if self.instance_id > Self::MAX_24_BIT {
            return Err(RayTracingError::InvalidInstance(format!(
                "instance id {} exceeds 24 bits",
                self.instance_id
            )));
        }
        if self.hit_group_offset > Self::MAX_24_BIT {
            return Err(RayTracingError::InvalidInstance(format!(
                "hit group offset {} exceeds 24 bits",
                self.hit_group_offset
            )));
        }
        let address = blas_addresses
            .get(self.blas.0 as usize)
            .copied()
            .ok_or_else(|| {
                RayTracingError::InvalidInstance(format!(
                    "BLAS index {} outside table of {}",
                    self.blas.0,
                    blas_addresses.len()
                ))
            })?;

        Ok(vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: transform_rows(&self.transform),
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.instance_id, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.hit_group_offset,
                self.flags.to_vk_bits(),
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: address,
            },
        })
    }
}

/// Row-major 3x4 matrix from a column-major transform.
pub fn transform_rows(m: &Mat4) -> [f32; 12] {
    let r0 = m.row(0);
    let r1 = m.row(1);
    let r2 = m.row(2);
    [
        r0.x, r0.y, r0.z, r0.w, r1.x, r1.y, r1.z, r1.w, r2.x, r2.y, r2.z, r2.w,
    ]
}

const INSTANCE_SIZE: u64 = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64;

/// Top-level acceleration structure with per-frame instance buffers.
pub struct TopLevelAs {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    instance_buffers: FrameRing<GpuBuffer>,
    max_instances: u32,
    instance_count: u32,
    flags: BuildFlags,
    prebuild: PrebuildInfo,
    built: bool,
}

impl TopLevelAs {
    /// Create a TLAS sized for `max_instances`.
    ///
    /// # Safety
    /// - Device, ray tracing loaders, and allocator must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        max_instances: u32,
        flags: BuildFlags,
    ) -> Result<Self> {
        let instance_buffers = FrameRing::try_from_fn_in(
            allocator,
            |allocator, i| {
                allocator.create_buffer(
                    INSTANCE_SIZE * u64::from(max_instances.max(1)),
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::CpuToGpu,
                    &format!("tlas_instances_{i}"),
                )
            },
            |allocator, mut buffer| {
                if let Err(e) = allocator.free_buffer(&mut buffer) {
                    tracing::warn!("failed to release instance buffer: {e}");
                }
            },
        )?;

        // Sizes depend on the instance count only, not on the data address.
        let geometry = instance_geometry(0);
        let prebuild = query_prebuild(
            rt,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            flags,
            &geometry,
            max_instances,
        );

        let (acceleration_structure, buffer, _) = match create_structure(
            rt,
            allocator,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            prebuild.result_size,
            "tlas_buffer",
        ) {
            Ok(created) => created,
            Err(e) => {
                for mut instance_buffer in instance_buffers.into_inner() {
                    allocator.free_buffer(&mut instance_buffer)?;
                }
                return Err(e);
            }
        };

        tracing::debug!(
            max_instances,
            size = prebuild.result_size,
            "created top-level acceleration structure"
        );

        Ok(Self {
            acceleration_structure,
            buffer,
            instance_buffers,
            max_instances,
            instance_count: 0,
            flags,
            prebuild,
            built: false,
        })
    }

    pub const fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    pub const fn prebuild_info(&self) -> PrebuildInfo {
        self.prebuild
    }

    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Bring the structure up to date for this frame, if anything changed.
    pub fn plan(&self, transforms_changed: bool) -> Option<BuildMode> {
        BuildMode::plan(
            self.built,
            transforms_changed,
            self.flags.contains(BuildFlags::ALLOW_UPDATE),
        )
    }

    /// Encode `instances` into the frame's instance buffer.
    ///
    /// An update must keep the instance count of the last full build.
    pub fn write_instances(
        &mut self,
        frame: FrameIndex,
        instances: &[InstanceDesc],
        blas_addresses: &[vk::DeviceAddress],
    ) -> Result<()> {
        if instances.len() > self.max_instances as usize {
            return Err(RayTracingError::InvalidInstance(format!(
                "{} instances exceed capacity {}",
                instances.len(),
                self.max_instances
            )));
        }

        let encoded = instances
            .iter()
            .map(|instance| instance.encode(blas_addresses))
            .collect::<Result<Vec<_>>>()?;

        // SAFETY: instance records are plain C data laid out as the API expects.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                encoded.as_ptr().cast::<u8>(),
                std::mem::size_of_val(encoded.as_slice()),
            )
        };
        self.instance_buffers[frame].write_bytes(0, bytes)?;
        self.instance_count = encoded.len() as u32;
        Ok(())
    }

    /// Record a build or refit from the frame's instance buffer.
    ///
    /// # Safety
    /// Every referenced BLAS must be built before this command executes, and
    /// `scratch_address` must hold `prebuild_info().max_scratch_size()` bytes.
    pub unsafe fn record_build<R: CommandRecorder + ?Sized>(
        &mut self,
        recorder: &mut R,
        device: &ash::Device,
        frame: FrameIndex,
        scratch_address: vk::DeviceAddress,
        mode: BuildMode,
    ) -> Result<()> {
        let mode = if self.built { mode } else { BuildMode::Build };
        let flags = match mode {
            BuildMode::Build => self.flags - BuildFlags::PERFORM_UPDATE,
            BuildMode::Update => self.flags | BuildFlags::PERFORM_UPDATE,
        };

        let geometry = instance_geometry(self.instance_buffers[frame].device_address(device));
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(flags.to_vk())
            .mode(flags.mode())
            .dst_acceleration_structure(self.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        if mode == BuildMode::Update {
            build_info = build_info.src_acceleration_structure(self.acceleration_structure);
        }

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.instance_count);

        recorder.build_acceleration_structures(&[build_info], &[std::slice::from_ref(&range)])?;
        recorder.memory_barrier(
            Access::AS_BUILD_WRITE,
            Access::RAY_TRACING_READ.and(Access::new(
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            )),
        );
        self.built = true;

        tracing::debug!(?mode, instances = self.instance_count, "recorded TLAS build");
        Ok(())
    }

    /// Destroy the TLAS and free resources.
    ///
    /// # Safety
    /// The TLAS must not be in use.
    pub unsafe fn destroy(mut self, rt: &RayTracingDevice, allocator: &mut GpuAllocator) -> Result<()> {
        rt.acceleration_structure
            .destroy_acceleration_structure(self.acceleration_structure, None);
        allocator.free_buffer(&mut self.buffer)?;
        for buffer in self.instance_buffers.iter_mut() {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};

    #[test]
    fn aabb_size() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
        assert_eq!(INSTANCE_SIZE, 64);
    }

    #[test]
    fn aabb_from_unit_cube() {
        let aabb = AabbPositions::from(Aabb::UNIT);
        assert_eq!(aabb.min_x, -1.0);
        assert_eq!(aabb.max_z, 1.0);
    }

    #[test]
    fn first_frame_builds_then_refits_on_change() {
        assert_eq!(BuildMode::plan(false, false, true), Some(BuildMode::Build));
        assert_eq!(BuildMode::plan(true, false, true), None);
        assert_eq!(BuildMode::plan(true, true, true), Some(BuildMode::Update));
        assert_eq!(BuildMode::plan(true, true, false), Some(BuildMode::Build));
    }

    #[test]
    fn transform_rows_are_row_major() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            glam::Quat::IDENTITY,
            Vec3::new(3.0, 4.0, 5.0),
        );
        assert_eq!(
            transform_rows(&m),
            [2.0, 0.0, 0.0, 3.0, 0.0, 2.0, 0.0, 4.0, 0.0, 0.0, 2.0, 5.0]
        );
    }

    #[test]
    fn rotated_instance_rows_transform_points() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::splat(0.5),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_3),
            Vec3::new(-1.0, 2.0, 0.25),
        );
        let encoded = InstanceDesc::volume(0, m, BlasIndex(0))
            .encode(&[0x1000])
            .unwrap();
        let rows = encoded.transform.matrix;
        let p = Vec3::new(1.0, -1.0, 1.0);
        let expected = m.transform_point3(p);
        for (axis, row) in rows.chunks_exact(4).enumerate() {
            let got = row[0] * p.x + row[1] * p.y + row[2] * p.z + row[3];
            assert_relative_eq!(got, expected[axis], epsilon = 1e-6);
        }
    }

    #[test]
    fn volume_instance_encoding() {
        let desc = InstanceDesc::volume(7, Mat4::IDENTITY, BlasIndex(1));
        let encoded = desc.encode(&[0x1000, 0x2000]).unwrap();
        assert_eq!(encoded.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(encoded.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            u32::from(encoded.instance_shader_binding_table_record_offset_and_flags.high_8()),
            vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE.as_raw()
        );
        // SAFETY: encode always writes the device handle variant.
        assert_eq!(unsafe { encoded.acceleration_structure_reference.device_handle }, 0x2000);
    }

    #[test]
    fn instance_rejects_dangling_blas_index() {
        let desc = InstanceDesc::volume(0, Mat4::IDENTITY, BlasIndex(3));
        assert!(matches!(
            desc.encode(&[0x1000]),
            Err(RayTracingError::InvalidInstance(_))
        ));
    }

    #[test]
    fn instance_id_is_limited_to_24_bits() {
        let desc = InstanceDesc::volume(1 << 24, Mat4::IDENTITY, BlasIndex(0));
        assert!(desc.encode(&[0x1000]).is_err());
    }

    #[test]
    fn prebuild_scratch_covers_updates() {
        let info = PrebuildInfo {
            result_size: 1024,
            scratch_size: 256,
            update_scratch_size: 512,
        };
        assert_eq!(info.max_scratch_size(), 512);
    }
}
