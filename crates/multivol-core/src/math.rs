//! Bounding boxes, proxy cube transforms, and frustum tests.

use glam::{Mat4, Vec3, Vec4};

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// The local-space proxy of every volume: the cube `[-1, 1]^3`.
    pub const UNIT: Self = Self::new(Vec3::NEG_ONE, Vec3::ONE);

    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB centered at `center` with given half-extents
    #[inline]
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// The eight corners, indexed by bit pattern (bit 0 = x, bit 1 = y, bit 2 = z).
    pub fn corners(&self) -> [Vec3; 8] {
        std::array::from_fn(|i| {
            Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        })
    }
}

/// World matrix of a cube proxy with edge length `size` centered at `pos`.
///
/// Maps the local cube `[-1, 1]^3` onto world space with a uniform scale.
#[inline]
pub fn cube_world(size: f32, pos: Vec3) -> Mat4 {
    Mat4::from_translation(pos) * Mat4::from_scale(Vec3::splat(size * 0.5))
}

/// Frustum for culling operations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far)
    /// Each plane is (nx, ny, nz, d) where n is a unit normal pointing inside.
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix with a `[0, 1]` depth range.
    pub fn from_view_projection(vp: Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        let planes = [
            row3 + row0, // Left
            row3 - row0, // Right
            row3 + row1, // Bottom
            row3 - row1, // Top
            row2,        // Near
            row3 - row2, // Far
        ]
        .map(|p| {
            let len = p.truncate().length();
            if len > 0.0 {
                p / len
            } else {
                p
            }
        });

        Self { planes }
    }

    /// Planes as plain arrays, in the layout the culling shader reads.
    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|p| p.to_array())
    }

    /// Test if an AABB is inside or intersects the frustum
    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();

            // The positive vertex is the corner furthest along the plane normal.
            let p = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);

            normal.dot(p) + plane.w >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Mat4 {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn corners_follow_bit_pattern() {
        let corners = Aabb::UNIT.corners();
        assert_eq!(corners[0], Vec3::NEG_ONE);
        assert_eq!(corners[7], Vec3::ONE);
        assert_eq!(corners[1], Vec3::new(1.0, -1.0, -1.0));
        assert_eq!(corners[6], Vec3::new(-1.0, 1.0, 1.0));
    }

    #[test]
    fn cube_world_maps_unit_cube_to_edge_length() {
        let world = cube_world(4.0, Vec3::new(1.0, 2.0, 3.0));
        let corners = Aabb::UNIT.corners().map(|c| world.transform_point3(c));
        assert_relative_eq!(corners[7].x - corners[0].x, 4.0);
        assert_relative_eq!((corners[7].y + corners[0].y) * 0.5, 2.0);
        assert_relative_eq!(corners[0].z, 1.0);
    }

    #[test]
    fn frustum_accepts_box_in_front_of_camera() {
        let frustum = Frustum::from_view_projection(camera());
        let aabb = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::ONE);
        assert!(frustum.test_aabb(&aabb));
    }

    #[test]
    fn frustum_rejects_boxes_outside() {
        let frustum = Frustum::from_view_projection(camera());
        let behind = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, 20.0), Vec3::ONE);
        let beside = Aabb::from_center_half_extents(Vec3::new(50.0, 0.0, 0.0), Vec3::ONE);
        let far = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, -200.0), Vec3::ONE);
        assert!(!frustum.test_aabb(&behind));
        assert!(!frustum.test_aabb(&beside));
        assert!(!frustum.test_aabb(&far));
    }

    #[test]
    fn frustum_accepts_box_straddling_a_plane() {
        let frustum = Frustum::from_view_projection(camera());
        // Half a unit inside the right edge of the view at z = 0.
        let edge = 10.0 * (30f32.to_radians()).tan();
        let aabb = Aabb::from_center_half_extents(Vec3::new(edge + 0.5, 0.0, 0.0), Vec3::ONE);
        assert!(frustum.test_aabb(&aabb));
    }

    #[test]
    fn frustum_planes_are_normalized() {
        let frustum = Frustum::from_view_projection(camera());
        for plane in frustum.planes {
            assert_relative_eq!(plane.truncate().length(), 1.0, epsilon = 1e-5);
        }
    }
}
