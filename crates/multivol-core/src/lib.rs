//! Core types and math for the multi-volume ray caster.
//!
//! This crate provides the foundational pieces shared by every layer:
//! - Bounding volumes, rays, and frustum culling
//! - The triple-buffered frame ring and frame index discipline
//! - Decoding of 3D volume texture files
//! - Common error types

pub mod error;
pub mod frame;
pub mod math;
pub mod volume_file;

pub use error::{Error, Result};
pub use frame::{FrameClock, FrameIndex, FrameRing, FRAME_COUNT};
pub use math::{Aabb, Frustum};
pub use volume_file::{VolumeFormat, VolumeTexture};

/// Renderer-wide constants shared with the shaders.
pub mod constants {
    /// Maximum number of volumes a single ray caster can hold.
    ///
    /// Bounded by the bits reserved for the volume index in an OIT layer key.
    pub const MAX_VOLUMES: u32 = 1 << VOLUME_INDEX_BITS;
    /// Bits of an OIT layer key reserved for the volume index.
    pub const VOLUME_INDEX_BITS: u32 = 6;
    /// Number of K-buffer layers kept per pixel.
    pub const OIT_LAYER_COUNT: u32 = 4;
    /// Maximum number of volume source files accepted by the settings.
    pub const MAX_VOLUME_FILES: usize = 10;
}
