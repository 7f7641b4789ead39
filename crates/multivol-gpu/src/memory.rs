//! Buffer and image allocation through `gpu-allocator`.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use std::ops::Range;
use std::sync::Arc;

/// Owns the device memory of every buffer and image.
///
/// Shared behind the context's mutex; [`Self::shutdown`] must run before
/// the device is destroyed.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let debug_settings = AllocatorDebugSettings {
            log_memory_information: cfg!(debug_assertions),
            log_leaks_on_shutdown: true,
            store_stack_traces: cfg!(debug_assertions),
            ..AllocatorDebugSettings::default()
        };
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings,
            // Acceleration structures and shader tables are addressed by pointer.
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))
    }

    /// Allocate memory for a resource, calling `discard` if that fails.
    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        discard: impl FnOnce(&ash::Device),
    ) -> Result<Allocation> {
        let desc = AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        };
        let result = self
            .inner()
            .and_then(|allocator| {
                allocator
                    .allocate(&desc)
                    .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
            });
        if result.is_err() {
            discard(&self.device);
        }
        result
    }

    fn release(&mut self, allocation: Option<Allocation>) -> Result<()> {
        match allocation {
            Some(allocation) => self
                .inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Create a buffer and bind fresh memory from `location` to it.
    ///
    /// `CpuToGpu` and `GpuToCpu` buffers stay persistently mapped.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocate(name, requirements, location, true, |device| unsafe {
            device.destroy_buffer(buffer, None);
        })?;

        let mut created = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };
        let bound = created.allocation.as_ref().map_or(Ok(()), |a| unsafe {
            self.device.bind_buffer_memory(buffer, a.memory(), a.offset())
        });
        if let Err(e) = bound {
            self.free_buffer(&mut created)?;
            return Err(e.into());
        }
        Ok(created)
    }

    /// Create a mapped buffer holding a copy of `data`.
    pub fn create_buffer_with_data(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let mut buffer =
            self.create_buffer(data.len() as u64, usage, MemoryLocation::CpuToGpu, name)?;
        if let Err(e) = buffer.write_bytes(0, data) {
            self.free_buffer(&mut buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }

    /// Destroy the buffer and return its memory. Safe to call twice.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        self.release(buffer.allocation.take())?;
        let handle = std::mem::replace(&mut buffer.buffer, vk::Buffer::null());
        unsafe { self.device.destroy_buffer(handle, None) };
        Ok(())
    }

    /// Create an image and bind device memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.allocate(name, requirements, location, false, |device| unsafe {
            device.destroy_image(image, None);
        })?;

        let mut created = GpuImage {
            image,
            allocation: Some(allocation),
            extent: create_info.extent,
            layers: create_info.array_layers,
        };
        let bound = created.allocation.as_ref().map_or(Ok(()), |a| unsafe {
            self.device.bind_image_memory(image, a.memory(), a.offset())
        });
        if let Err(e) = bound {
            self.free_image(&mut created)?;
            return Err(e.into());
        }
        Ok(created)
    }

    /// Destroy the image and return its memory. Safe to call twice.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        self.release(image.allocation.take())?;
        let handle = std::mem::replace(&mut image.image, vk::Image::null());
        unsafe { self.device.destroy_image(handle, None) };
        Ok(())
    }

    /// Drop the allocator, reporting any allocation still alive as a leak.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer and the memory bound to it.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    fn range(&self, offset: u64, len: usize) -> Result<Range<usize>> {
        let end = offset.checked_add(len as u64).filter(|end| *end <= self.size);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(GpuError::InvalidState(format!(
                "{len} bytes at {offset} exceed buffer of {} bytes",
                self.size
            ))),
        }
    }

    fn not_mapped() -> GpuError {
        GpuError::InvalidState("buffer is not host visible".to_string())
    }

    /// Copy `data` into the mapped buffer at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len())?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(Self::not_mapped)?;
        mapped[range].copy_from_slice(data);
        Ok(())
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy `len` bytes at `offset` out of the mapped buffer.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(offset, len)?;
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(Self::not_mapped)?;
        Ok(mapped[range].to_vec())
    }
}

/// An image and the memory bound to it.
pub struct GpuImage {
    pub image: vk::Image,
    allocation: Option<Allocation>,
    pub extent: vk::Extent3D,
    pub layers: u32,
}

impl GpuImage {
    /// Color subresource range covering every layer of the first mip.
    pub fn color_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(self.layers)
    }

    /// View over the first mip and every layer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_view(
        &self,
        device: &ash::Device,
        view_type: vk::ImageViewType,
        format: vk::Format,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(format)
            .subresource_range(self.color_range());
        Ok(device.create_image_view(&info, None)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmapped(size: u64) -> GpuBuffer {
        GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size,
        }
    }

    #[test]
    fn ranges_stay_inside_the_buffer() {
        let buffer = unmapped(16);
        assert_eq!(buffer.range(4, 12).unwrap(), 4..16);
        assert!(buffer.range(4, 13).is_err());
        assert!(buffer.range(u64::MAX, 1).is_err());
    }

    #[test]
    fn unmapped_buffers_reject_host_access() {
        let mut buffer = unmapped(8);
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(buffer.read_bytes(0, 8).is_err());
    }
}
