//! Capability flag sets for acceleration structures.
//!
//! These are opaque bit sets; [`BuildFlags::to_vk`] and friends translate
//! them at the Vulkan boundary instead of sharing bit positions.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Acceleration structure build options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY = 1 << 4;
        /// Refit an existing structure in place instead of rebuilding it.
        const PERFORM_UPDATE = 1 << 5;
    }
}

bitflags! {
    /// Per-geometry options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT = 1 << 1;
    }
}

bitflags! {
    /// Per-instance options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

impl BuildFlags {
    /// Vulkan build flags. `PERFORM_UPDATE` selects the build mode instead.
    pub fn to_vk(self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
        for (flag, bit) in [
            (Self::ALLOW_UPDATE, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
            (
                Self::ALLOW_COMPACTION,
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            ),
            (
                Self::PREFER_FAST_TRACE,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            ),
            (
                Self::PREFER_FAST_BUILD,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            ),
            (Self::MINIMIZE_MEMORY, vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY),
        ] {
            if self.contains(flag) {
                out |= bit;
            }
        }
        out
    }

    /// Vulkan build mode implied by `PERFORM_UPDATE`.
    pub fn mode(self) -> vk::BuildAccelerationStructureModeKHR {
        if self.contains(Self::PERFORM_UPDATE) {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        }
    }
}

impl GeometryFlags {
    pub fn to_vk(self) -> vk::GeometryFlagsKHR {
        let mut out = vk::GeometryFlagsKHR::empty();
        if self.contains(Self::OPAQUE) {
            out |= vk::GeometryFlagsKHR::OPAQUE;
        }
        if self.contains(Self::NO_DUPLICATE_ANY_HIT) {
            out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
        }
        out
    }
}

impl InstanceFlags {
    /// Vulkan instance flags, narrowed to the 8 bits an instance record holds.
    pub fn to_vk_bits(self) -> u8 {
        let mut out = vk::GeometryInstanceFlagsKHR::empty();
        for (flag, bit) in [
            (
                Self::TRIANGLE_CULL_DISABLE,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            ),
            (
                Self::TRIANGLE_FRONT_COUNTERCLOCKWISE,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FRONT_COUNTERCLOCKWISE,
            ),
            (Self::FORCE_OPAQUE, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE),
            (Self::FORCE_NON_OPAQUE, vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE),
        ] {
            if self.contains(flag) {
                out |= bit;
            }
        }
        out.as_raw() as u8
    }
}

/// Kind of hit group in a ray tracing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupType {
    Triangles,
    Procedural,
}

impl HitGroupType {
    pub const fn to_vk(self) -> vk::RayTracingShaderGroupTypeKHR {
        match self {
            Self::Triangles => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            Self::Procedural => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_flags_translate_without_update_bit() {
        let flags = BuildFlags::ALLOW_UPDATE | BuildFlags::PREFER_FAST_TRACE;
        assert_eq!(
            flags.to_vk(),
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        );
        assert_eq!(flags.mode(), vk::BuildAccelerationStructureModeKHR::BUILD);

        let update = flags | BuildFlags::PERFORM_UPDATE;
        assert_eq!(update.to_vk(), flags.to_vk());
        assert_eq!(update.mode(), vk::BuildAccelerationStructureModeKHR::UPDATE);
    }

    #[test]
    fn flag_sets_compose() {
        let a = GeometryFlags::OPAQUE;
        let b = GeometryFlags::NO_DUPLICATE_ANY_HIT;
        assert!((a | b).contains(a));
        assert!((a & b).is_empty());
        assert_eq!(GeometryFlags::empty().to_vk(), vk::GeometryFlagsKHR::empty());
    }

    #[test]
    fn non_opaque_instance_bit() {
        assert_eq!(
            u32::from(InstanceFlags::FORCE_NON_OPAQUE.to_vk_bits()),
            vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE.as_raw()
        );
        assert_eq!(InstanceFlags::empty().to_vk_bits(), 0);
    }

    #[test]
    fn hit_group_types() {
        assert_eq!(
            HitGroupType::Procedural.to_vk(),
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        );
    }
}
