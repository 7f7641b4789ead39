//! Volume culling and indirect argument generation.
//!
//! The GPU pass (`volume_cull.comp`) is authoritative at runtime. The host
//! functions here compute the same visible set, levels of detail, and
//! indirect arguments from the same inputs, and serve as ground truth in tests.

use glam::{Mat4, Vec4Swizzles};
use multivol_core::{Aabb, Frustum};
use multivol_shaders::CULL_GROUP_SIZE;

use crate::gpu_types::{CounterReset, DispatchArgs, DrawIndexedArgs};

/// Level of detail stored for a culled volume.
pub const CULLED_LOD: u32 = u32::MAX;

/// World-space bounds of the cube proxy `[-1, 1]^3` under `world`.
///
/// Same center/extent construction as the shader: the half extent along each
/// axis is the sum of the absolute basis components.
pub fn proxy_bounds(world: &Mat4) -> Aabb {
    let center = world.w_axis.xyz();
    let extent = world.x_axis.xyz().abs() + world.y_axis.xyz().abs() + world.z_axis.xyz().abs();
    Aabb::from_center_half_extents(center, extent)
}

/// Cube map level of detail for bounds with the given projected footprint.
///
/// Returns 0 when the volume covers at least `grid_size` pixels, or when any
/// corner is behind the eye.
pub fn footprint_lod(bounds: &Aabb, view_proj: &Mat4, viewport: [u32; 2], grid_size: u32) -> u32 {
    let mut lo = glam::Vec2::ONE;
    let mut hi = -glam::Vec2::ONE;
    for corner in bounds.corners() {
        let clip = *view_proj * corner.extend(1.0);
        if clip.w <= 0.0 {
            return 0;
        }
        let ndc = (clip.xy() / clip.w).clamp(-glam::Vec2::ONE, glam::Vec2::ONE);
        lo = lo.min(ndc);
        hi = hi.max(ndc);
    }
    let pixels = (hi - lo) * 0.5 * glam::Vec2::new(viewport[0] as f32, viewport[1] as f32);
    let footprint = pixels.max_element().max(1.0);
    let grid = grid_size as f32;
    if footprint >= grid {
        0
    } else {
        (grid / footprint).log2().floor() as u32
    }
}

/// Result of culling a set of volumes on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CullResult {
    /// Indices of visible volumes in ascending order.
    pub visible: Vec<u32>,
    /// Per-volume level of detail, [`CULLED_LOD`] for culled volumes.
    pub lods: Vec<u32>,
}

impl CullResult {
    pub fn visible_count(&self) -> u32 {
        self.visible.len() as u32
    }
}

/// Cull volumes with the given world matrices against `view_proj`.
pub fn cull_volumes(
    worlds: &[Mat4],
    view_proj: &Mat4,
    viewport: [u32; 2],
    grid_size: u32,
) -> CullResult {
    let frustum = Frustum::from_view_projection(*view_proj);
    let mut result = CullResult {
        visible: Vec::new(),
        lods: Vec::with_capacity(worlds.len()),
    };
    for (i, world) in worlds.iter().enumerate() {
        let bounds = proxy_bounds(world);
        if frustum.test_aabb(&bounds) {
            result.visible.push(i as u32);
            result
                .lods
                .push(footprint_lod(&bounds, view_proj, viewport, grid_size));
        } else {
            result.lods.push(CULLED_LOD);
        }
    }
    result
}

/// Workgroups of the culling pass for `num_volumes` volumes.
pub const fn cull_group_count(num_volumes: u32) -> u32 {
    num_volumes.div_ceil(CULL_GROUP_SIZE)
}

/// Indirect arguments derived from a visible count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectArgs {
    pub dispatch: DispatchArgs,
    pub draw: DrawIndexedArgs,
}

impl IndirectArgs {
    /// Arguments the culling pass produces when `visible` volumes pass.
    pub const fn from_visible_count(visible: u32, grid_size: u32) -> Self {
        let after = CounterReset::new(grid_size).after_cull(visible);
        Self {
            dispatch: after.dispatch,
            draw: after.draw,
        }
    }

    /// Whether the indirect commands do any work.
    pub const fn is_empty(&self) -> bool {
        self.dispatch.z == 0 && self.draw.instance_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;
    use multivol_core::math::cube_world;

    const VIEWPORT: [u32; 2] = [1280, 720];

    fn view_proj() -> Mat4 {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn bounds_of_scaled_cube() {
        let bounds = proxy_bounds(&cube_world(4.0, Vec3::new(1.0, 2.0, 3.0)));
        assert_relative_eq!(bounds.min.x, -1.0);
        assert_relative_eq!(bounds.max.z, 5.0);
    }

    #[test]
    fn visible_count_matches_ground_truth() {
        let worlds = [
            cube_world(1.0, Vec3::ZERO),
            cube_world(1.0, Vec3::new(500.0, 0.0, 0.0)),
            cube_world(1.0, Vec3::new(2.0, 1.0, 0.0)),
            cube_world(1.0, Vec3::new(0.0, 0.0, 50.0)),
            cube_world(1.0, Vec3::new(0.0, 0.0, -200.0)),
        ];
        let result = cull_volumes(&worlds, &view_proj(), VIEWPORT, 64);
        assert_eq!(result.visible, vec![0, 2]);
        assert_eq!(result.lods[1], CULLED_LOD);
        assert_eq!(result.lods[3], CULLED_LOD);
        assert_eq!(result.lods[4], CULLED_LOD);
        assert_ne!(result.lods[0], CULLED_LOD);
    }

    #[test]
    fn all_volumes_outside_yield_no_work() {
        let worlds: Vec<Mat4> = (0..4)
            .map(|i| cube_world(1.0, Vec3::new(1000.0 + i as f32 * 10.0, 0.0, 0.0)))
            .collect();
        let result = cull_volumes(&worlds, &view_proj(), VIEWPORT, 8);
        assert_eq!(result.visible_count(), 0);

        let args = IndirectArgs::from_visible_count(result.visible_count(), 8);
        assert!(args.is_empty());
        assert_eq!(args.dispatch.z, 0);
        assert_eq!(args.draw.instance_count, 0);
    }

    #[test]
    fn indirect_args_round_up_dispatch() {
        for (count, groups) in [(1, 1), (4, 1), (5, 2), (8, 2), (9, 3)] {
            let args = IndirectArgs::from_visible_count(count, 16);
            assert_eq!(args.dispatch.z, groups);
            assert_eq!(args.draw.instance_count, count);
            assert_eq!(args.draw.index_count, 36);
        }
    }

    #[test]
    fn lod_grows_as_volume_shrinks_on_screen() {
        let vp = view_proj();
        let near = footprint_lod(&proxy_bounds(&cube_world(4.0, Vec3::ZERO)), &vp, VIEWPORT, 128);
        let far = footprint_lod(
            &proxy_bounds(&cube_world(0.1, Vec3::ZERO)),
            &vp,
            VIEWPORT,
            128,
        );
        assert_eq!(near, 0);
        assert!(far > near);
    }

    #[test]
    fn lod_is_zero_when_behind_eye() {
        let bounds = proxy_bounds(&cube_world(1.0, Vec3::new(0.0, 0.0, 20.0)));
        assert_eq!(footprint_lod(&bounds, &view_proj(), VIEWPORT, 128), 0);
    }

    #[test]
    fn cull_groups_cover_volumes() {
        assert_eq!(cull_group_count(1), 1);
        assert_eq!(cull_group_count(64), 1);
        assert_eq!(cull_group_count(65), 2);
    }
}
