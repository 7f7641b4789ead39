//! Vulkan capability layer for the multi-volume ray caster.
//!
//! This crate provides:
//! - Vulkan instance and device management, with optional ray tracing
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Descriptor and pipeline helpers
//! - Command recording behind the [`CommandRecorder`] capability trait
//! - Frame fences and deferred deletion of transient uploads

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{
    Access, ColorTarget, CommandPool, CommandRecorder, ImageBarrier, RenderingDesc,
    TraceRaysRegions, VulkanRecorder,
};
pub use context::{GpuContext, GpuContextBuilder, RayTracingDevice};
pub use deferred::DeferredDeletionQueue;
pub use descriptors::{merge_pool_sizes, DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{BlendMode, ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig};
pub use sync::{create_fence, FrameFences};
