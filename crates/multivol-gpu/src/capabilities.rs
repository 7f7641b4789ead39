//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Hardware ray tracing limits, present only when the device supports the
/// acceleration-structure and ray-tracing-pipeline extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size of an opaque shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of a shader record stride.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of a shader table start address.
    pub shader_group_base_alignment: u32,
    /// Maximum stride of a shader record.
    pub max_shader_group_stride: u32,
    /// Maximum trace recursion depth.
    pub max_ray_recursion_depth: u32,
    /// Required alignment of acceleration structure scratch memory.
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingCapabilities {
    /// Device extensions required for the hardware ray tracing path.
    pub const REQUIRED_EXTENSIONS: [&'static CStr; 3] = [
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ];

    /// Check whether every required extension is available.
    pub fn extensions_present(available: &HashSet<String>) -> bool {
        Self::REQUIRED_EXTENSIONS
            .iter()
            .all(|ext| ext.to_str().is_ok_and(|name| available.contains(name)))
    }

    /// Query ray tracing limits.
    ///
    /// # Safety
    /// The instance and physical device must be valid and the required
    /// extensions must be available on the device.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut pipeline_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut pipeline_props)
            .push_next(&mut as_props);
        instance.get_physical_device_properties2(physical_device, &mut props2);

        Self {
            shader_group_handle_size: pipeline_props.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_props.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline_props.shader_group_base_alignment,
            max_shader_group_stride: pipeline_props.max_shader_group_stride,
            max_ray_recursion_depth: pipeline_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_props
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

/// What the selected device offers the ray caster.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    /// Vulkan 1.3 core: dynamic rendering, synchronization2, buffer device
    /// addresses, and descriptor indexing.
    pub supports_vulkan_1_3: bool,
    /// Storage image atomics from fragment shaders, used by depth peeling.
    pub supports_fragment_stores_and_atomics: bool,
    pub device_local_memory_mb: u64,
    /// Upper bound on volume texture edges.
    pub max_image_dimension_3d: u32,
    /// Upper bound on cube layers across all volumes.
    pub max_image_array_layers: u32,
    /// Hardware ray tracing, if available.
    pub ray_tracing: Option<RayTracingCapabilities>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);

        let available: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();
        let ray_tracing = RayTracingCapabilities::extensions_present(&available)
            .then(|| RayTracingCapabilities::query(instance, physical_device));

        let device_local_memory_mb = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size >> 20)
            .sum();

        let api_version = properties.api_version;
        let version = (
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
        );

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version,
            supports_vulkan_1_3: version >= (1, 3),
            supports_fragment_stores_and_atomics: features.fragment_stores_and_atomics
                == vk::TRUE,
            device_local_memory_mb,
            max_image_dimension_3d: properties.limits.max_image_dimension3_d,
            max_image_array_layers: properties.limits.max_image_array_layers,
            ray_tracing,
        }
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub const fn meets_requirements(&self) -> bool {
        self.supports_vulkan_1_3 && self.supports_fragment_stores_and_atomics
    }

    /// Whether the hardware ray tracing path can be used.
    pub const fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing.is_some()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_ray_tracing() { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    fn capabilities() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "test".to_string(),
            api_version: vk::API_VERSION_1_3,
            supports_vulkan_1_3: true,
            supports_fragment_stores_and_atomics: true,
            device_local_memory_mb: 8192,
            max_image_dimension_3d: 2048,
            max_image_array_layers: 2048,
            ray_tracing: None,
        }
    }

    #[test]
    fn depth_peeling_needs_fragment_stores() {
        assert!(capabilities().meets_requirements());
        let caps = GpuCapabilities {
            supports_fragment_stores_and_atomics: false,
            ..capabilities()
        };
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn summary_reports_ray_tracing() {
        let summary = capabilities().summary();
        assert!(summary.starts_with("test (Amd) - Vulkan 1.3.0"));
        assert!(summary.ends_with("ray tracing: no"));
    }

    #[test]
    fn ray_tracing_needs_all_extensions() {
        let mut available: HashSet<String> = [
            "VK_KHR_acceleration_structure",
            "VK_KHR_ray_tracing_pipeline",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert!(!RayTracingCapabilities::extensions_present(&available));

        available.insert("VK_KHR_deferred_host_operations".to_string());
        assert!(RayTracingCapabilities::extensions_present(&available));
    }
}
