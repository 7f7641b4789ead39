//! Shader tables for the ray tracing pipeline.
//!
//! A table is a GPU buffer of fixed-stride records. Each record is an opaque
//! shader group identifier followed by optional local arguments. Records own
//! a copy of their identifier bytes, so a table stays valid independently of
//! the handle query that produced them.

use crate::error::{RayTracingError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use multivol_gpu::{GpuAllocator, GpuBuffer, RayTracingCapabilities, RayTracingDevice};

/// Round `value` up to a multiple of `alignment` (a power of two).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// One shader table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderRecord {
    identifier: Vec<u8>,
    local_args: Vec<u8>,
}

impl ShaderRecord {
    pub fn new(identifier: &[u8]) -> Self {
        Self {
            identifier: identifier.to_vec(),
            local_args: Vec::new(),
        }
    }

    /// Attach local root arguments placed right after the identifier.
    #[must_use]
    pub fn with_local_args(mut self, args: &[u8]) -> Self {
        self.local_args = args.to_vec();
        self
    }

    pub fn size(&self) -> u64 {
        (self.identifier.len() + self.local_args.len()) as u64
    }
}

/// Placement of records inside a table buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub stride: u64,
    pub count: u64,
    pub size: u64,
}

impl ShaderTableLayout {
    pub fn new(
        name: &'static str,
        records: &[ShaderRecord],
        caps: &RayTracingCapabilities,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(RayTracingError::EmptyTable(name));
        }

        let largest = records
            .iter()
            .map(ShaderRecord::size)
            .max()
            .unwrap_or(0)
            .max(u64::from(caps.shader_group_handle_size));
        let stride = align_up(largest, u64::from(caps.shader_group_handle_alignment));
        if stride > u64::from(caps.max_shader_group_stride) {
            return Err(RayTracingError::Unsupported(format!(
                "{name}: record stride {stride} exceeds device limit {}",
                caps.max_shader_group_stride
            )));
        }

        let count = records.len() as u64;
        Ok(Self {
            stride,
            count,
            size: align_up(stride * count, u64::from(caps.shader_group_base_alignment)),
        })
    }

    /// Lay the records out at `stride`, zero-filling the gaps.
    pub fn serialize(&self, records: &[ShaderRecord]) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size as usize];
        for (i, record) in records.iter().enumerate() {
            let start = i * self.stride as usize;
            let args_start = start + record.identifier.len();
            bytes[start..args_start].copy_from_slice(&record.identifier);
            bytes[args_start..args_start + record.local_args.len()]
                .copy_from_slice(&record.local_args);
        }
        bytes
    }
}

/// Split the packed handle query of `group_count` groups into per-group identifiers.
///
/// # Safety
/// `pipeline` must be a ray tracing pipeline with at least `group_count` groups.
pub unsafe fn group_handles(
    rt: &RayTracingDevice,
    pipeline: vk::Pipeline,
    group_count: u32,
) -> Result<Vec<Vec<u8>>> {
    let handle_size = rt.capabilities.shader_group_handle_size as usize;
    let data = rt.pipeline.get_ray_tracing_shader_group_handles(
        pipeline,
        0,
        group_count,
        handle_size * group_count as usize,
    )?;
    Ok(data.chunks_exact(handle_size).map(<[u8]>::to_vec).collect())
}

/// A GPU-resident shader table.
pub struct ShaderTable {
    buffer: GpuBuffer,
    region: vk::StridedDeviceAddressRegionKHR,
    layout: ShaderTableLayout,
}

impl ShaderTable {
    /// Upload `records`. Ray generation tables must hold a single record.
    pub fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        name: &'static str,
        records: &[ShaderRecord],
        caps: &RayTracingCapabilities,
    ) -> Result<Self> {
        let layout = ShaderTableLayout::new(name, records, caps)?;
        let base_alignment = u64::from(caps.shader_group_base_alignment.max(1));

        let mut buffer = allocator.create_buffer(
            layout.size + base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            name,
        )?;

        let base = buffer.device_address(device);
        let start = align_up(base, base_alignment);
        if let Err(e) = buffer.write_bytes(start - base, &layout.serialize(records)) {
            allocator.free_buffer(&mut buffer)?;
            return Err(e.into());
        }

        tracing::debug!(
            table = name,
            records = layout.count,
            stride = layout.stride,
            "uploaded shader table"
        );

        Ok(Self {
            buffer,
            region: vk::StridedDeviceAddressRegionKHR {
                device_address: start,
                stride: layout.stride,
                size: layout.stride * layout.count,
            },
            layout,
        })
    }

    pub const fn region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.region
    }

    pub const fn layout(&self) -> ShaderTableLayout {
        self.layout
    }

    /// Destroy the table and free resources.
    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> RayTracingCapabilities {
        RayTracingCapabilities {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_shader_group_stride: 4096,
            max_ray_recursion_depth: 1,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn stride_covers_identifier_and_local_args() {
        let records = [
            ShaderRecord::new(&[1; 32]),
            ShaderRecord::new(&[2; 32]).with_local_args(&[9; 8]),
        ];
        let layout = ShaderTableLayout::new("hit", &records, &caps()).unwrap();
        assert_eq!(layout.stride, 64);
        assert_eq!(layout.count, 2);
        assert_eq!(layout.size, 128);
    }

    #[test]
    fn serialized_records_sit_at_stride_boundaries() {
        let records = [
            ShaderRecord::new(&[1; 32]).with_local_args(&[7; 4]),
            ShaderRecord::new(&[2; 32]),
        ];
        let layout = ShaderTableLayout::new("miss", &records, &caps()).unwrap();
        let bytes = layout.serialize(&records);
        assert_eq!(&bytes[0..32], &[1; 32]);
        assert_eq!(&bytes[32..36], &[7; 4]);
        assert!(bytes[36..64].iter().all(|&b| b == 0));
        assert_eq!(&bytes[64..96], &[2; 32]);
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(matches!(
            ShaderTableLayout::new("raygen", &[], &caps()),
            Err(RayTracingError::EmptyTable("raygen"))
        ));
    }

    #[test]
    fn oversized_stride_is_rejected() {
        let mut limits = caps();
        limits.max_shader_group_stride = 32;
        let records = [ShaderRecord::new(&[0; 32]).with_local_args(&[0; 16])];
        assert!(ShaderTableLayout::new("hit", &records, &limits).is_err());
    }
}
