//! Host mirrors of the buffers and push constants the shaders read.
//!
//! Layouts follow `common.glsl`: `CbPerFrame` is a std140 uniform block, the
//! rest are std430 storage buffer elements.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use multivol_shaders::{FACE_TILE, VOLUMES_PER_GROUP};

/// Indices drawn per cube proxy.
pub const CUBE_INDEX_COUNT: u32 = 36;

/// Triangle list over the eight corners `(x, y, z) = bits (1, 2, 4)` of the unit cube.
pub const CUBE_INDICES: [u16; CUBE_INDEX_COUNT as usize] = [
    0, 2, 1, 1, 2, 3, // -z
    4, 5, 6, 5, 7, 6, // +z
    0, 1, 4, 1, 5, 4, // -y
    2, 6, 3, 3, 6, 7, // +y
    0, 4, 2, 2, 4, 6, // -x
    1, 3, 5, 3, 7, 5, // +x
];

/// Per-frame constants (`set = 0, binding = 0`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CbPerFrame {
    pub view_proj: [[f32; 4]; 4],
    pub view_proj_inv: [[f32; 4]; 4],
    pub shadow_view_proj: [[f32; 4]; 4],
    pub light_map_world: [[f32; 4]; 4],
    pub light_map_world_inv: [[f32; 4]; 4],
    pub frustum_planes: [[f32; 4]; 6],
    pub eye_pos: [f32; 4],
    pub light_pos: [f32; 4],
    /// Color times intensity.
    pub light_color: [f32; 4],
    /// Color times intensity.
    pub ambient: [f32; 4],
    pub viewport: [u32; 2],
    pub max_ray_samples: u32,
    pub max_light_samples: u32,
    pub num_volumes: u32,
    pub grid_size: u32,
    pub light_grid_size: u32,
    pub has_irradiance: u32,
}

impl CbPerFrame {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Per-volume transforms for one frame (`set = 0, binding = 1`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PerObject {
    pub world_view_proj: [[f32; 4]; 4],
    pub world: [[f32; 4]; 4],
    pub world_inv: [[f32; 4]; 4],
    /// Eye point in the volume's local `[-1, 1]^3` frame.
    pub local_eye: [f32; 4],
}

impl PerObject {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Transforms of a volume seen from `eye` through `view_proj`.
    pub fn new(world: Mat4, view_proj: Mat4, eye: Vec3) -> Self {
        let world_inv = world.inverse();
        Self {
            world_view_proj: (view_proj * world).to_cols_array_2d(),
            world: world.to_cols_array_2d(),
            world_inv: world_inv.to_cols_array_2d(),
            local_eye: world_inv.transform_point3(eye).extend(1.0).to_array(),
        }
    }
}

/// Static description of a volume (`set = 1, binding = 0`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VolumeDesc {
    pub volume_id: u32,
    pub src_id: u32,
    pub reserved: [u32; 2],
}

impl VolumeDesc {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub const fn new(volume_id: u32, src_id: u32) -> Self {
        Self {
            volume_id,
            src_id,
            reserved: [0; 2],
        }
    }
}

/// Indirect dispatch arguments, laid out as `VkDispatchIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Indirect indexed draw arguments, laid out as `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl DrawIndexedArgs {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Values copied over the visible counter and indirect arguments before every cull.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct CounterReset {
    pub visible_count: u32,
    pub dispatch: DispatchArgs,
    pub draw: DrawIndexedArgs,
}

impl CounterReset {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
    pub const COUNT_OFFSET: u64 = std::mem::offset_of!(Self, visible_count) as u64;
    pub const DISPATCH_OFFSET: u64 = std::mem::offset_of!(Self, dispatch) as u64;
    pub const DRAW_OFFSET: u64 = std::mem::offset_of!(Self, draw) as u64;

    /// Reset values for a cube map face of `grid_size` texels.
    ///
    /// The culling pass only ever increments the dispatch `z` count and the
    /// draw instance count; everything else is fixed here.
    pub const fn new(grid_size: u32) -> Self {
        let tiles = grid_size.div_ceil(FACE_TILE);
        Self {
            visible_count: 0,
            dispatch: DispatchArgs {
                x: 6 * tiles,
                y: tiles,
                z: 0,
            },
            draw: DrawIndexedArgs {
                index_count: CUBE_INDEX_COUNT,
                instance_count: 0,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
        }
    }

    /// Arguments the culling pass leaves behind after `visible` volumes passed.
    pub const fn after_cull(self, visible: u32) -> Self {
        let mut out = self;
        out.visible_count = visible;
        out.dispatch.z = visible.div_ceil(VOLUMES_PER_GROUP);
        out.draw.instance_count = visible;
        out
    }
}

/// Push constant of the depth-peel pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PeelPushConstants {
    pub layer: u32,
}

/// Push constant of the volume load pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct LoadPushConstants {
    pub channel_count: u32,
}

/// Push constant of the placeholder volume pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct InitPushConstants {
    pub seed: u32,
}

/// Size shared by every single-word push constant block.
pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<u32>() as u32;

pub(crate) fn vec4(v: Vec3, w: f32) -> [f32; 4] {
    Vec4::from((v, w)).to_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::mem::{offset_of, size_of};

    #[test]
    fn per_frame_matches_std140_block() {
        assert_eq!(size_of::<CbPerFrame>(), 512);
        assert_eq!(offset_of!(CbPerFrame, view_proj_inv), 64);
        assert_eq!(offset_of!(CbPerFrame, light_map_world_inv), 256);
        assert_eq!(offset_of!(CbPerFrame, frustum_planes), 320);
        assert_eq!(offset_of!(CbPerFrame, eye_pos), 416);
        assert_eq!(offset_of!(CbPerFrame, ambient), 464);
        assert_eq!(offset_of!(CbPerFrame, viewport), 480);
        assert_eq!(offset_of!(CbPerFrame, max_ray_samples), 488);
        assert_eq!(offset_of!(CbPerFrame, grid_size), 500);
        assert_eq!(offset_of!(CbPerFrame, has_irradiance), 508);
    }

    #[test]
    fn per_object_matches_std430_struct() {
        assert_eq!(size_of::<PerObject>(), 208);
        assert_eq!(offset_of!(PerObject, world), 64);
        assert_eq!(offset_of!(PerObject, world_inv), 128);
        assert_eq!(offset_of!(PerObject, local_eye), 192);
    }

    #[test]
    fn small_layouts() {
        assert_eq!(size_of::<VolumeDesc>(), 16);
        assert_eq!(size_of::<DispatchArgs>(), 12);
        assert_eq!(DrawIndexedArgs::SIZE, 20);
        assert_eq!(CounterReset::SIZE, 36);
        assert_eq!(CounterReset::DISPATCH_OFFSET, 4);
        assert_eq!(CounterReset::DRAW_OFFSET, 16);
    }

    #[test]
    fn reset_covers_every_face_tile() {
        let reset = CounterReset::new(30);
        assert_eq!(reset.dispatch, DispatchArgs { x: 48, y: 8, z: 0 });
        assert_eq!(reset.draw.index_count, 36);
        assert_eq!(reset.draw.instance_count, 0);
    }

    #[test]
    fn local_eye_is_in_cube_frame() {
        let world = multivol_core::math::cube_world(4.0, Vec3::new(10.0, 0.0, 0.0));
        let obj = PerObject::new(world, Mat4::IDENTITY, Vec3::new(10.0, 0.0, 6.0));
        assert_relative_eq!(obj.local_eye[0], 0.0);
        assert_relative_eq!(obj.local_eye[2], 3.0);
        assert_relative_eq!(obj.local_eye[3], 1.0);
    }

    #[test]
    fn cube_indices_reference_all_corners() {
        let mut seen = [false; 8];
        for &i in &CUBE_INDICES {
            seen[usize::from(i)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
