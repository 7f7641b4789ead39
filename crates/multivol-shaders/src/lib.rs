//! GLSL shaders for the multi-volume ray caster and their SPIR-V bytecode.
//!
//! Shaders are compiled at build time using shaderc. The host-side constants
//! that the shaders also hard-code (layer count, volume index width, group
//! sizes) are checked against the GLSL sources in the tests below.

use std::sync::OnceLock;

/// Shared GLSL declarations, kept for consistency checks.
pub const COMMON_GLSL: &str = include_str!("../shaders/common.glsl");

/// Invocations per workgroup of the culling pass.
pub const CULL_GROUP_SIZE: u32 = 64;
/// Visible volumes handled by one `RayMarchV` workgroup along z.
pub const VOLUMES_PER_GROUP: u32 = 4;
/// Cube face texels per `RayMarchV` workgroup along x and y.
pub const FACE_TILE: u32 = 4;
/// Workgroup edge of the light-grid and volume initialization passes.
pub const VOXEL_GROUP_SIZE: u32 = 4;

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    macro_rules! spirv {
        ($name:ident, $file:literal) => {
            pub static $name: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/", $file));
        };
    }

    spirv!(VOLUME_CULL, "volume_cull.spv");
    spirv!(RAY_MARCH_L, "ray_march_l.spv");
    spirv!(RAY_MARCH_V, "ray_march_v.spv");
    spirv!(LOAD_VOLUME_DATA, "load_volume_data.spv");
    spirv!(INIT_VOLUME_DATA, "init_volume_data.spv");
    spirv!(CUBE_VERT, "cube_vert.spv");
    spirv!(CUBE_DEPTH_PEEL_FRAG, "cube_depth_peel_frag.spv");
    spirv!(RENDER_CUBE_FRAG, "render_cube_frag.spv");
    spirv!(FULLSCREEN_VERT, "fullscreen_vert.spv");
    spirv!(RESOLVE_OIT_FRAG, "resolve_oit_frag.spv");
    spirv!(RAY_TRACE_RGEN, "ray_trace_rgen.spv");
    spirv!(RAY_TRACE_RMISS, "ray_trace_rmiss.spv");
    spirv!(RAY_TRACE_RINT, "ray_trace_rint.spv");
    spirv!(RAY_TRACE_RAHIT, "ray_trace_rahit.spv");
}

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

macro_rules! shader_accessor {
    ($(#[$doc:meta])* $fn_name:ident, $bytes:ident) => {
        $(#[$doc])*
        pub fn $fn_name() -> &'static [u32] {
            static SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
            SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::$bytes))
        }
    };
}

shader_accessor!(
    /// Frustum culling and indirect argument generation.
    volume_cull_shader,
    VOLUME_CULL
);
shader_accessor!(
    /// Light propagation into the light grid.
    ray_march_l_shader,
    RAY_MARCH_L
);
shader_accessor!(
    /// Per-volume cube map march.
    ray_march_v_shader,
    RAY_MARCH_V
);
shader_accessor!(
    /// Resample a loaded volume file into a volume texture.
    load_volume_data_shader,
    LOAD_VOLUME_DATA
);
shader_accessor!(
    /// Procedural volume fill.
    init_volume_data_shader,
    INIT_VOLUME_DATA
);
shader_accessor!(
    /// Instanced bounding cube vertex stage.
    cube_vertex_shader,
    CUBE_VERT
);
shader_accessor!(
    /// Depth peeling fragment stage.
    cube_depth_peel_shader,
    CUBE_DEPTH_PEEL_FRAG
);
shader_accessor!(
    /// Layer color fragment stage.
    render_cube_shader,
    RENDER_CUBE_FRAG
);
shader_accessor!(
    /// Fullscreen triangle vertex stage.
    fullscreen_vertex_shader,
    FULLSCREEN_VERT
);
shader_accessor!(
    /// Sort and composite the layer list.
    resolve_oit_shader,
    RESOLVE_OIT_FRAG
);
shader_accessor!(ray_trace_raygen_shader, RAY_TRACE_RGEN);
shader_accessor!(ray_trace_miss_shader, RAY_TRACE_RMISS);
shader_accessor!(ray_trace_intersection_shader, RAY_TRACE_RINT);
shader_accessor!(ray_trace_any_hit_shader, RAY_TRACE_RAHIT);

#[cfg(test)]
mod tests {
    use super::*;
    use multivol_core::constants::{OIT_LAYER_COUNT, VOLUME_INDEX_BITS};

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn define(name: &str) -> Option<u32> {
        COMMON_GLSL.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("#define ")?;
            let (key, value) = rest.split_once(char::is_whitespace)?;
            if key != name {
                return None;
            }
            value.trim().trim_end_matches('u').parse().ok()
        })
    }

    #[test]
    fn glsl_constants_match_host() {
        assert_eq!(define("NUM_K_LAYERS"), Some(OIT_LAYER_COUNT));
        assert_eq!(define("VOLUME_INDEX_BITS"), Some(VOLUME_INDEX_BITS));
        assert_eq!(define("CULL_GROUP_SIZE"), Some(CULL_GROUP_SIZE));
        assert_eq!(define("VOLUMES_PER_GROUP"), Some(VOLUMES_PER_GROUP));
        assert_eq!(define("FACE_TILE"), Some(FACE_TILE));
    }

    #[test]
    fn every_stage_is_valid_spirv() {
        let shaders = [
            volume_cull_shader(),
            ray_march_l_shader(),
            ray_march_v_shader(),
            load_volume_data_shader(),
            init_volume_data_shader(),
            cube_vertex_shader(),
            cube_depth_peel_shader(),
            render_cube_shader(),
            fullscreen_vertex_shader(),
            resolve_oit_shader(),
            ray_trace_raygen_shader(),
            ray_trace_miss_shader(),
            ray_trace_intersection_shader(),
            ray_trace_any_hit_shader(),
        ];
        for shader in shaders {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 5, "Shader too small");
        }
    }
}
