//! Ray tracing error types.

use multivol_gpu::GpuError;
use thiserror::Error;

/// Errors raised while building acceleration structures or shader tables.
#[derive(Error, Debug)]
pub enum RayTracingError {
    /// Underlying GPU failure.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// The device lacks the ray tracing extensions.
    #[error("Ray tracing unsupported: {0}")]
    Unsupported(String),

    /// An instance description cannot be encoded.
    #[error("Invalid TLAS instance: {0}")]
    InvalidInstance(String),

    /// A shader table was requested without records.
    #[error("Shader table '{0}' has no records")]
    EmptyTable(&'static str),
}

impl From<ash::vk::Result> for RayTracingError {
    fn from(result: ash::vk::Result) -> Self {
        Self::Gpu(GpuError::Vulkan(result))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RayTracingError>;
