//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan 1.3 instance with no surface extensions.
///
/// Validation is skipped with a warning when the layer is not installed.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(version)
        .engine_name(c"MultiVol")
        .engine_version(version)
        .api_version(vk::API_VERSION_1_3);

    let mut extension_names: Vec<*const i8> = Vec::new();
    let mut flags = vk::InstanceCreateFlags::empty();
    if cfg!(target_os = "macos") {
        // MoltenVK is only enumerated through the portability extension.
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let mut layer_names: Vec<*const i8> = Vec::new();
    if enable_validation {
        let installed = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER);
        if installed {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!(layer = ?VALIDATION_LAYER, "validation layer not available");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// What device selection looks at for one physical device.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    api_version: u32,
    device_type: vk::PhysicalDeviceType,
    device_local_bytes: u64,
    fragment_stores: bool,
    ray_tracing: bool,
}

impl Candidate {
    unsafe fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(device);
        let features = instance.get_physical_device_features(device);
        let memory = instance.get_physical_device_memory_properties(device);
        let device_local_bytes = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();
        let ray_tracing = instance
            .enumerate_device_extension_properties(device)
            .map(|exts| {
                exts.iter().any(|ext| {
                    CStr::from_ptr(ext.extension_name.as_ptr())
                        == ash::khr::ray_tracing_pipeline::NAME
                })
            })
            .unwrap_or(false);

        Self {
            api_version: properties.api_version,
            device_type: properties.device_type,
            device_local_bytes,
            fragment_stores: features.fragment_stores_and_atomics == vk::TRUE,
            ray_tracing,
        }
    }

    /// Selection score, or `None` when the device cannot run the caster.
    ///
    /// Requires Vulkan 1.3 and fragment storage writes (depth peeling).
    /// Prefers discrete GPUs, then ray tracing support, then memory.
    fn score(&self) -> Option<u64> {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        if (major, minor) < (1, 3) || !self.fragment_stores {
            return None;
        }

        let kind = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        let ray_tracing = if self.ray_tracing { 500 } else { 0 };
        let gigabytes = self.device_local_bytes >> 30;
        Some(kind + ray_tracing + gigabytes)
    }
}

/// Pick the highest scoring usable physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter_map(|device| Candidate::query(instance, device).score().map(|s| (s, device)))
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            api_version: vk::API_VERSION_1_3,
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            device_local_bytes: 2 << 30,
            fragment_stores: true,
            ray_tracing: false,
        }
    }

    #[test]
    fn old_api_versions_are_rejected() {
        let old = Candidate {
            api_version: vk::API_VERSION_1_2,
            ..candidate()
        };
        assert_eq!(old.score(), None);
        assert_eq!(candidate().score(), Some(102));
    }

    #[test]
    fn fragment_stores_are_required() {
        let c = Candidate {
            fragment_stores: false,
            ..candidate()
        };
        assert_eq!(c.score(), None);
    }

    #[test]
    fn discrete_ray_tracing_devices_win() {
        let discrete = Candidate {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            ..candidate()
        };
        let traced = Candidate {
            ray_tracing: true,
            ..discrete
        };
        assert!(discrete.score() > candidate().score());
        assert!(traced.score() > discrete.score());
    }
}
