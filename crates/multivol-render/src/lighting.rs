//! Light parameters and light volume bookkeeping.

use glam::{Mat4, Vec3};
use multivol_core::math::cube_world;

/// Scene light and ambient term, plus the placement of the light volume.
#[derive(Clone, Debug, PartialEq)]
pub struct LightState {
    position: Vec3,
    color: Vec3,
    intensity: f32,
    ambient_color: Vec3,
    ambient_intensity: f32,
    light_map_world: Mat4,
    /// Light volume holds results for the current parameters.
    computed: bool,
    /// Parameters changed since the light volume was last computed.
    stale: bool,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            position: Vec3::new(75.0, 75.0, -75.0),
            color: Vec3::ONE,
            intensity: 3.0,
            ambient_color: Vec3::new(0.4, 0.55, 0.8),
            ambient_intensity: 0.4,
            light_map_world: cube_world(32.0, Vec3::ZERO),
            computed: false,
            stale: true,
        }
    }
}

impl LightState {
    pub fn set_light(&mut self, position: Vec3, color: Vec3, intensity: f32) {
        self.position = position;
        self.color = color;
        self.intensity = intensity;
        self.stale = true;
    }

    pub fn set_ambient(&mut self, color: Vec3, intensity: f32) {
        self.ambient_color = color;
        self.ambient_intensity = intensity;
        self.stale = true;
    }

    /// Place the light volume as a cube of edge `size` centered at `pos`.
    pub fn set_light_map_world(&mut self, size: f32, pos: Vec3) {
        self.light_map_world = cube_world(size, pos);
        self.stale = true;
    }

    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Light color scaled by intensity.
    pub fn radiance(&self) -> Vec3 {
        self.color * self.intensity
    }

    /// Ambient color scaled by intensity.
    pub fn ambient(&self) -> Vec3 {
        self.ambient_color * self.ambient_intensity
    }

    pub const fn light_map_world(&self) -> Mat4 {
        self.light_map_world
    }

    /// Whether the light volume has been computed at least once.
    pub const fn is_computed(&self) -> bool {
        self.computed
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Decide whether this frame propagates light.
    ///
    /// An explicit request or a never-computed light volume records the
    /// pass. Once computed, a stale light volume is reused until the caller
    /// asks for an update.
    pub fn should_propagate(&self, update_light: bool) -> bool {
        if !self.computed {
            return true;
        }
        if !update_light && self.stale {
            tracing::trace!("light volume is stale; reusing previous result");
        }
        update_light
    }

    /// Record that the light volume now reflects the current parameters.
    pub fn mark_propagated(&mut self) {
        self.computed = true;
        self.stale = false;
    }
}
