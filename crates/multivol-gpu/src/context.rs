//! GPU context management.

use crate::capabilities::{GpuCapabilities, RayTracingCapabilities};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Device, allocator, and the queue every ray caster pass is submitted to.
///
/// Culling, light propagation, rasterization, ray tracing, and uploads are
/// recorded into the same command buffers, so a single queue family that
/// supports graphics and compute is enough.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,
    ray_tracing: Option<RayTracingDevice>,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Queue supporting graphics, compute, and transfer.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Ray tracing extension loaders, present only when the device was
    /// created with hardware ray tracing enabled.
    pub fn ray_tracing(&self) -> Option<&RayTracingDevice> {
        self.ray_tracing.as_ref()
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    enable_ray_tracing: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "MultiVol".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_ray_tracing: true,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Request hardware ray tracing when the device supports it.
    ///
    /// Devices without support still build; the context then reports no
    /// ray tracing and callers stay on the rasterized path.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.enable_ray_tracing = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let physical_device = unsafe { select_physical_device(&instance) }?;

        let mut capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !self.enable_ray_tracing {
            capabilities.ray_tracing = None;
        }
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());
        if self.enable_ray_tracing && capabilities.ray_tracing.is_none() {
            tracing::warn!("Hardware ray tracing unavailable; only the rasterized path will be used");
        }

        let graphics_queue_family = unsafe { find_graphics_queue_family(&instance, physical_device) }?;
        let device = unsafe {
            create_device(&instance, physical_device, graphics_queue_family, &capabilities)?
        };
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let device = Arc::new(device);

        let ray_tracing = capabilities.ray_tracing.map(|caps| RayTracingDevice {
            acceleration_structure: ash::khr::acceleration_structure::Device::new(
                &instance, &device,
            ),
            pipeline: ash::khr::ray_tracing_pipeline::Device::new(&instance, &device),
            capabilities: caps,
        });

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            ray_tracing,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

/// First queue family supporting both graphics and compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(required))
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Device extensions to enable for the given capabilities.
fn device_extensions(capabilities: &GpuCapabilities) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if capabilities.ray_tracing.is_some() {
        extensions.extend_from_slice(&RayTracingCapabilities::REQUIRED_EXTENSIONS);
    }
    extensions
}

/// Create the logical device with one queue from `queue_family`.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    capabilities: &GpuCapabilities,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let extensions = device_extensions(capabilities);
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Dynamic rendering for the peel, cube, and resolve passes; sync2 for
    // every barrier.
    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    // Device addresses for acceleration structures and shader tables; the
    // volume texture array is indexed non-uniformly.
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .descriptor_binding_partially_bound(true);

    // Layer keys are written with image atomics from fragment shaders.
    let features = vk::PhysicalDeviceFeatures::default().fragment_stores_and_atomics(true);

    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);
    let mut rt_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if capabilities.ray_tracing.is_some() {
        features2 = features2.push_next(&mut as_features).push_next(&mut rt_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

/// Extension loaders and limits for hardware ray tracing.
pub struct RayTracingDevice {
    /// `VK_KHR_acceleration_structure` entry points.
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    /// `VK_KHR_ray_tracing_pipeline` entry points.
    pub pipeline: ash::khr::ray_tracing_pipeline::Device,
    /// Limits queried at device selection.
    pub capabilities: RayTracingCapabilities,
}
