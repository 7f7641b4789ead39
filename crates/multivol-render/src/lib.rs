//! Multi-volume ray caster.
//!
//! This crate provides:
//! - GPU culling of volume proxies with indirect dispatch and draw arguments
//! - Light propagation into a shared light volume
//! - Per-volume cube map marching
//! - Order-independent transparency by depth peeling or hardware ray tracing
//! - Camera and view management
//! - Offscreen capture for headless runs

pub mod camera;
pub mod capture;
pub mod caster;
pub mod config;
pub mod culling;
pub mod descriptors;
pub mod error;
pub mod gpu_types;
pub mod lighting;
pub mod loader;
pub mod oit;
pub mod passes;
pub mod pipelines;
pub mod ray_tracing;
pub mod resources;
pub mod scene;

#[cfg(test)]
mod test_support;

pub use camera::Camera;
pub use capture::{capture_path, save_png, CaptureError, CaptureTarget, CAPTURE_FORMAT};
pub use caster::{check_frame_index, MultiRayCaster};
pub use config::{OitMethod, RayCasterConfig, RenderSettings};
pub use culling::{cull_volumes, CullResult, IndirectArgs};
pub use descriptors::{LightTable, SampledImage};
pub use error::{RenderError, Result};
pub use lighting::LightState;
pub use loader::SourceKind;
pub use oit::{decode_layer_key, encode_layer_key, resolve_layers};
pub use resources::{GpuVisibility, Texture};
pub use scene::{FrameView, SceneState};
