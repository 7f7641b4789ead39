//! Render error types.

use multivol_gpu::GpuError;
use multivol_raytracing::RayTracingError;
use thiserror::Error;

/// Errors surfaced by the ray caster.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    RayTracing(#[from] RayTracingError),

    #[error(transparent)]
    Core(#[from] multivol_core::Error),

    /// A volume index at or beyond the configured volume count.
    #[error("Volume index {index} out of range (volume count {count})")]
    InvalidVolumeIndex { index: u32, count: u32 },

    /// A frame index outside `[0, FRAME_COUNT)`.
    #[error("Invalid frame index: {0}")]
    InvalidFrameIndex(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A volume file could not be read or decoded. The slot is unchanged.
    #[error("Failed to load volume {index} from {path}: {source}")]
    VolumeLoad {
        index: u32,
        path: String,
        #[source]
        source: multivol_core::Error,
    },
}

impl From<ash::vk::Result> for RenderError {
    fn from(result: ash::vk::Result) -> Self {
        Self::Gpu(GpuError::Vulkan(result))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
