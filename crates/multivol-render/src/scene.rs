//! Host-side scene state: volume placement, view, and sampling settings.

use glam::{Mat4, UVec3, Vec3};
use multivol_core::math::cube_world;
use multivol_core::Frustum;

use crate::error::{RenderError, Result};
use crate::gpu_types::{vec4, CbPerFrame, PerObject};
use crate::lighting::LightState;

/// View parameters supplied once per frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameView {
    pub view_proj: Mat4,
    /// View-projection of the shadow map the light pass tests against.
    pub shadow_view_proj: Mat4,
    pub eye: Vec3,
}

impl Default for FrameView {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            shadow_view_proj: Mat4::IDENTITY,
            eye: Vec3::ZERO,
        }
    }
}

/// Edge length of the smallest cube lattice holding `n` cells.
pub fn lattice_side(n: u32) -> u32 {
    let mut side = 1;
    while side * side * side < n {
        side += 1;
    }
    side
}

/// Lattice cell of volume `index` on a lattice of `side` cells per edge.
pub const fn lattice_cell(index: u32, side: u32) -> UVec3 {
    UVec3::new(index % side, (index / side) % side, index / (side * side))
}

/// Volume transforms and per-frame sampling state.
#[derive(Clone, Debug)]
pub struct SceneState {
    worlds: Vec<Mat4>,
    /// Bumped on every transform change.
    generation: u64,
    viewport: [u32; 2],
    max_ray_samples: u32,
    max_light_samples: u32,
    has_irradiance: bool,
    pub light: LightState,
}

impl SceneState {
    /// Scene with `num_volumes` unit volumes on a lattice around the origin.
    pub fn new(num_volumes: u32) -> Self {
        let mut scene = Self {
            worlds: vec![Mat4::IDENTITY; num_volumes as usize],
            generation: 0,
            viewport: [1, 1],
            max_ray_samples: 256,
            max_light_samples: 64,
            has_irradiance: false,
            light: LightState::default(),
        };
        scene.set_volumes_world(2.0, Vec3::ZERO);
        scene
    }

    pub fn num_volumes(&self) -> u32 {
        self.worlds.len() as u32
    }

    fn check_index(&self, index: u32) -> Result<usize> {
        if index < self.num_volumes() {
            Ok(index as usize)
        } else {
            Err(RenderError::InvalidVolumeIndex {
                index,
                count: self.num_volumes(),
            })
        }
    }

    /// Place every volume on a cubic lattice of spacing `size`, centered on
    /// `center`, each volume a cube of edge `size`.
    pub fn set_volumes_world(&mut self, size: f32, center: Vec3) {
        let side = lattice_side(self.num_volumes());
        let offset = Vec3::splat((side - 1) as f32 * 0.5);
        for (i, world) in self.worlds.iter_mut().enumerate() {
            let cell = lattice_cell(i as u32, side).as_vec3();
            *world = cube_world(size, center + (cell - offset) * size);
        }
        self.generation += 1;
    }

    /// Place volume `index` as a cube of edge `size` centered at `pos`.
    pub fn set_volume_world(&mut self, index: u32, size: f32, pos: Vec3) -> Result<()> {
        let i = self.check_index(index)?;
        let world = cube_world(size, pos);
        if self.worlds[i] != world {
            self.worlds[i] = world;
            self.generation += 1;
        }
        Ok(())
    }

    pub fn worlds(&self) -> &[Mat4] {
        &self.worlds
    }

    pub fn world(&self, index: u32) -> Result<Mat4> {
        Ok(self.worlds[self.check_index(index)?])
    }

    /// Changes whenever any transform changes.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = [width.max(1), height.max(1)];
    }

    pub const fn viewport(&self) -> [u32; 2] {
        self.viewport
    }

    pub fn set_max_samples(&mut self, max_ray_samples: u32, max_light_samples: u32) {
        self.max_ray_samples = max_ray_samples.max(1);
        self.max_light_samples = max_light_samples.max(1);
    }

    pub const fn max_samples(&self) -> (u32, u32) {
        (self.max_ray_samples, self.max_light_samples)
    }

    pub fn set_has_irradiance(&mut self, has_irradiance: bool) {
        self.has_irradiance = has_irradiance;
    }

    /// Per-frame constants for `view`.
    pub fn per_frame_constants(
        &self,
        view: &FrameView,
        grid_size: u32,
        light_grid_size: u32,
    ) -> CbPerFrame {
        let light_map_world = self.light.light_map_world();
        CbPerFrame {
            view_proj: view.view_proj.to_cols_array_2d(),
            view_proj_inv: view.view_proj.inverse().to_cols_array_2d(),
            shadow_view_proj: view.shadow_view_proj.to_cols_array_2d(),
            light_map_world: light_map_world.to_cols_array_2d(),
            light_map_world_inv: light_map_world.inverse().to_cols_array_2d(),
            frustum_planes: Frustum::from_view_projection(view.view_proj).to_arrays(),
            eye_pos: vec4(view.eye, 1.0),
            light_pos: vec4(self.light.position(), 1.0),
            light_color: vec4(self.light.radiance(), 1.0),
            ambient: vec4(self.light.ambient(), 1.0),
            viewport: self.viewport,
            max_ray_samples: self.max_ray_samples,
            max_light_samples: self.max_light_samples,
            num_volumes: self.num_volumes(),
            grid_size,
            light_grid_size,
            has_irradiance: u32::from(self.has_irradiance),
        }
    }

    /// Per-volume transforms for `view`.
    pub fn per_objects(&self, view: &FrameView) -> Vec<PerObject> {
        self.worlds
            .iter()
            .map(|&world| PerObject::new(world, view.view_proj, view.eye))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4Swizzles;

    #[test]
    fn lattice_side_is_ceil_cbrt() {
        assert_eq!(lattice_side(1), 1);
        assert_eq!(lattice_side(2), 2);
        assert_eq!(lattice_side(8), 2);
        assert_eq!(lattice_side(9), 3);
        assert_eq!(lattice_side(27), 3);
        assert_eq!(lattice_side(64), 4);
    }

    #[test]
    fn lattice_is_centered() {
        let mut scene = SceneState::new(8);
        scene.set_volumes_world(2.0, Vec3::new(0.0, 5.0, 0.0));
        let centroid = scene
            .worlds()
            .iter()
            .fold(Vec3::ZERO, |acc, w| acc + w.w_axis.xyz())
            / 8.0;
        assert_relative_eq!(centroid.y, 5.0, epsilon = 1e-5);
        assert_relative_eq!(centroid.x, 0.0, epsilon = 1e-5);

        let first = scene.world(0).unwrap();
        assert_relative_eq!(first.w_axis.x, -1.0);
        assert_relative_eq!(first.x_axis.x, 1.0);
    }

    #[test]
    fn single_volume_edits_bump_generation_once() {
        let mut scene = SceneState::new(4);
        let g = scene.generation();
        scene.set_volume_world(3, 1.0, Vec3::X).unwrap();
        assert_eq!(scene.generation(), g + 1);
        scene.set_volume_world(3, 1.0, Vec3::X).unwrap();
        assert_eq!(scene.generation(), g + 1);
    }

    #[test]
    fn out_of_range_volume_is_rejected() {
        let mut scene = SceneState::new(4);
        let err = scene.set_volume_world(4, 1.0, Vec3::ZERO).unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidVolumeIndex { index: 4, count: 4 }
        ));
    }

    #[test]
    fn constants_carry_scene_settings() {
        let mut scene = SceneState::new(3);
        scene.set_viewport(640, 480);
        scene.set_max_samples(0, 32);
        scene.set_has_irradiance(true);
        let view = FrameView {
            eye: Vec3::new(1.0, 2.0, 3.0),
            ..FrameView::default()
        };
        let cb = scene.per_frame_constants(&view, 64, 32);
        assert_eq!(cb.viewport, [640, 480]);
        assert_eq!(scene.max_samples(), (1, 32));
        assert_eq!(cb.max_ray_samples, 1);
        assert_eq!(cb.max_light_samples, 32);
        assert_eq!(cb.num_volumes, 3);
        assert_eq!(cb.grid_size, 64);
        assert_eq!(cb.light_grid_size, 32);
        assert_eq!(cb.has_irradiance, 1);
        assert_eq!(cb.eye_pos, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(scene.per_objects(&view).len(), 3);
    }
}
