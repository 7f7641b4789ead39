//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors from the Vulkan capability layer.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No device passes [`crate::GpuCapabilities::meets_requirements`].
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A command needs an extension the device was created without, such as
    /// ray tracing.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// SPIR-V was rejected when creating a shader module.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A buffer or mapping was used in a way its creation does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
