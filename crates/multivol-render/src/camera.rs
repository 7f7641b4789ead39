//! Camera and view management.

use glam::{Mat4, Vec3};
use multivol_core::Frustum;

use crate::scene::FrameView;

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 10.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Create a camera at `position` looking at `target`.
    pub fn new(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let direction = (target - position).normalize();
        Self {
            position,
            direction,
            up,
            fov,
            aspect,
            near,
            far,
        }
    }

    /// Camera on a sphere of `radius` around `target`.
    ///
    /// `yaw` turns around +Y starting from +Z; `pitch` lifts toward +Y.
    pub fn orbit(target: Vec3, radius: f32, yaw: f32, pitch: f32, aspect: f32) -> Self {
        let offset = Vec3::new(
            yaw.sin() * pitch.cos(),
            pitch.sin(),
            yaw.cos() * pitch.cos(),
        ) * radius;
        Self {
            aspect,
            ..Self::new(
                target + offset,
                target,
                Vec3::Y,
                std::f32::consts::FRAC_PI_4,
                aspect,
                0.1,
                1000.0,
            )
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Right-handed perspective with depth in `[0, 1]` and Y pointing down in
    /// clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y = -projection.y_axis.y;
        projection
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }

    /// Per-frame view parameters, with `shadow_view_proj` for the light pass.
    pub fn frame_view(&self, shadow_view_proj: Mat4) -> FrameView {
        FrameView {
            view_proj: self.view_projection_matrix(),
            shadow_view_proj,
            eye: self.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn orbit_looks_at_target() {
        let camera = Camera::orbit(Vec3::ONE, 5.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(camera.position.z, 6.0, epsilon = 1e-5);
        assert_relative_eq!(camera.direction.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn look_at_turns_toward_target() {
        let mut camera = Camera::orbit(Vec3::ZERO, 4.0, 0.0, 0.0, 1.0);
        camera.look_at(Vec3::new(0.0, 0.0, 8.0));
        assert_relative_eq!(camera.direction.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn clip_space_y_points_down() {
        let camera = Camera {
            aspect: 1.0,
            ..Camera::default()
        };
        let above = camera
            .view_projection_matrix()
            .project_point3(Vec3::new(0.0, 1.0, 0.0));
        assert!(above.y < 0.0);
        assert!((0.0..=1.0).contains(&above.z));
    }

    #[test]
    fn frame_view_carries_eye() {
        let camera = Camera::default();
        let view = camera.frame_view(Mat4::IDENTITY);
        assert_eq!(view.eye, camera.position);
        assert_eq!(view.shadow_view_proj, Mat4::IDENTITY);
        assert!(camera.frustum().test_aabb(&multivol_core::Aabb::UNIT));
    }
}
