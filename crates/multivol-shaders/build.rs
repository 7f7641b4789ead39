//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, IncludeType, ResolvedInclude, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Every shader stage compiled into the crate, with its output stem.
const SHADERS: &[(&str, &str, ShaderKind)] = &[
    ("volume_cull.comp", "volume_cull", ShaderKind::Compute),
    ("ray_march_l.comp", "ray_march_l", ShaderKind::Compute),
    ("ray_march_v.comp", "ray_march_v", ShaderKind::Compute),
    ("load_volume_data.comp", "load_volume_data", ShaderKind::Compute),
    ("init_volume_data.comp", "init_volume_data", ShaderKind::Compute),
    ("cube.vert", "cube_vert", ShaderKind::Vertex),
    ("cube_depth_peel.frag", "cube_depth_peel_frag", ShaderKind::Fragment),
    ("render_cube.frag", "render_cube_frag", ShaderKind::Fragment),
    ("fullscreen.vert", "fullscreen_vert", ShaderKind::Vertex),
    ("resolve_oit.frag", "resolve_oit_frag", ShaderKind::Fragment),
    ("ray_trace.rgen", "ray_trace_rgen", ShaderKind::RayGeneration),
    ("ray_trace.rmiss", "ray_trace_rmiss", ShaderKind::Miss),
    ("ray_trace.rint", "ray_trace_rint", ShaderKind::Intersection),
    ("ray_trace.rahit", "ray_trace_rahit", ShaderKind::AnyHit),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let shader_dir = Path::new("shaders");

    // Rerun if shaders change
    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for (source, stem, kind) in SHADERS {
        compile_shader(
            &compiler,
            shader_dir,
            source,
            out_dir.join(format!("{stem}.spv")),
            *kind,
        );
    }
}

fn resolve_include(
    shader_dir: &Path,
    requested: &str,
    include_type: IncludeType,
    requesting: &str,
) -> Result<ResolvedInclude, String> {
    if include_type != IncludeType::Relative {
        return Err(format!("{requesting}: only relative includes are supported"));
    }
    let path = shader_dir.join(requested);
    let content = fs::read_to_string(&path)
        .map_err(|e| format!("{requesting}: cannot include {requested}: {e}"))?;
    Ok(ResolvedInclude {
        resolved_name: path.to_string_lossy().into_owned(),
        content,
    })
}

fn compile_shader(
    compiler: &Compiler,
    shader_dir: &Path,
    file_name: &str,
    output: impl AsRef<Path>,
    kind: ShaderKind,
) {
    let input_path = shader_dir.join(file_name);
    let output_path = output.as_ref();

    let source = fs::read_to_string(&input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    let include_dir = shader_dir.to_path_buf();
    options.set_include_callback(move |requested, include_type, requesting, _depth| {
        resolve_include(&include_dir, requested, include_type, requesting)
    });

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {input_path:?}: {}",
            result.get_warning_messages()
        );
    }

    fs::write(
        output_path,
        bytemuck::cast_slice::<u32, u8>(result.as_binary()),
    )
    .unwrap_or_else(|e| panic!("Failed to write shader {output_path:?}: {e}"));
}
