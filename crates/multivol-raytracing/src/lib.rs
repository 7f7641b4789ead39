//! Hardware ray tracing layer for the multi-volume ray caster.
//!
//! This crate wraps:
//! - `VK_KHR_acceleration_structure` (procedural BLAS over volume proxies, one TLAS
//!   instance per volume)
//! - `VK_KHR_ray_tracing_pipeline` (raygen, miss and an intersection + any-hit group)
//! - shader tables assembled from group handles and local arguments
//!
//! Every entry point expects a [`multivol_gpu::RayTracingDevice`]; callers
//! without one stay on the rasterized path and never touch this crate's GPU
//! objects.

pub mod acceleration;
pub mod error;
pub mod flags;
pub mod pipeline;
pub mod shader_table;

pub use acceleration::{
    transform_rows, AabbPositions, AccelerationScratch, BlasIndex, BottomLevelAs, BuildMode,
    InstanceDesc, PrebuildInfo, TopLevelAs,
};
pub use error::{RayTracingError, Result};
pub use flags::{BuildFlags, GeometryFlags, HitGroupType, InstanceFlags};
pub use pipeline::RayTracingPipeline;
pub use shader_table::{ShaderRecord, ShaderTable, ShaderTableLayout};
