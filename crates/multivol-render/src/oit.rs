//! Per-pixel layer keys and the nearest-K layer list.
//!
//! A layer key packs the distance from the eye to a volume's first dense
//! sample with the volume index in the low bits. Keys are unique per pixel
//! and order by distance first, then by volume index, so both the depth-peel
//! and the ray tracing path keep exactly the same K layers when more volumes
//! overlap a pixel than there are layers.

use glam::Vec4;
use multivol_core::constants::{OIT_LAYER_COUNT, VOLUME_INDEX_BITS};

/// Key of an unused layer.
pub const EMPTY_KEY: u32 = u32::MAX;

const VOLUME_INDEX_MASK: u32 = (1 << VOLUME_INDEX_BITS) - 1;

/// Number of layers kept per pixel.
pub const LAYER_COUNT: usize = OIT_LAYER_COUNT as usize;

/// Pack a distance and volume index into a layer key.
///
/// Negative distances clamp to zero. The low mantissa bits of the distance
/// are dropped in favor of the volume index.
pub fn encode_layer_key(distance: f32, volume: u32) -> u32 {
    (distance.max(0.0).to_bits() & !VOLUME_INDEX_MASK) | (volume & VOLUME_INDEX_MASK)
}

/// Split a layer key into its (truncated) distance and volume index.
pub fn decode_layer_key(key: u32) -> (f32, u32) {
    (
        f32::from_bits(key & !VOLUME_INDEX_MASK),
        key & VOLUME_INDEX_MASK,
    )
}

/// One layer: a key and its premultiplied color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Layer {
    pub key: u32,
    pub color: Vec4,
}

impl Layer {
    pub const EMPTY: Self = Self {
        key: EMPTY_KEY,
        color: Vec4::ZERO,
    };
}

/// Fixed-capacity list holding the K nearest layers, sorted by key.
///
/// Host model of the insertion done by the peel passes and the any-hit shader.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LayerList {
    layers: [Layer; LAYER_COUNT],
}

#[cfg(test)]
impl Default for LayerList {
    fn default() -> Self {
        Self {
            layers: [Layer::EMPTY; LAYER_COUNT],
        }
    }
}

#[cfg(test)]
impl LayerList {
    /// Insert a layer, evicting the farthest when full.
    ///
    /// Returns `false` if the layer was farther than every kept layer.
    pub(crate) fn insert(&mut self, key: u32, color: Vec4) -> bool {
        let Some(pos) = self.layers.iter().position(|l| key < l.key) else {
            return false;
        };
        self.layers.copy_within(pos..LAYER_COUNT - 1, pos + 1);
        self.layers[pos] = Layer { key, color };
        true
    }

    /// Layers in use, nearest first.
    pub(crate) fn live(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(|l| l.key != EMPTY_KEY)
    }
}

/// Composite layers back to front with premultiplied "over".
///
/// Layers may arrive in any order; empty keys are skipped. Returns `None`
/// when no layer is live, in which case the background is left untouched.
pub fn resolve_layers(layers: &[Layer]) -> Option<Vec4> {
    let mut live: Vec<&Layer> = layers.iter().filter(|l| l.key != EMPTY_KEY).collect();
    if live.is_empty() {
        return None;
    }
    live.sort_by_key(|l| l.key);
    Some(
        live.iter()
            .rev()
            .fold(Vec4::ZERO, |acc, l| blend_over(l.color, acc)),
    )
}

/// Blend a resolved color over the existing target, as the resolve pipeline does.
pub fn blend_over(src: Vec4, dst: Vec4) -> Vec4 {
    src + (1.0 - src.w) * dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn premul(rgb: [f32; 3], alpha: f32) -> Vec4 {
        Vec4::new(rgb[0] * alpha, rgb[1] * alpha, rgb[2] * alpha, alpha)
    }

    #[test]
    fn keys_order_by_distance_then_volume() {
        let near = encode_layer_key(1.0, 5);
        let far = encode_layer_key(2.0, 0);
        assert!(near < far);
        assert!(encode_layer_key(1.0, 1) < encode_layer_key(1.0, 2));
        assert_ne!(encode_layer_key(3.0, 7), EMPTY_KEY);
    }

    #[test]
    fn key_keeps_volume_and_approximate_distance() {
        let (distance, volume) = decode_layer_key(encode_layer_key(12.5, 42));
        assert_eq!(volume, 42);
        assert_relative_eq!(distance, 12.5, max_relative = 1e-5);
        assert_eq!(decode_layer_key(encode_layer_key(-3.0, 1)).0, 0.0);
    }

    #[test]
    fn closed_form_back_to_front_blend() {
        let c1 = premul([1.0, 0.0, 0.0], 0.5);
        let c2 = premul([0.0, 1.0, 0.0], 0.25);
        let c3 = premul([0.0, 0.0, 1.0], 0.75);
        // Deliberately out of order.
        let layers = [
            Layer {
                key: encode_layer_key(3.0, 2),
                color: c3,
            },
            Layer::EMPTY,
            Layer {
                key: encode_layer_key(1.0, 0),
                color: c1,
            },
            Layer {
                key: encode_layer_key(2.0, 1),
                color: c2,
            },
        ];
        let resolved = resolve_layers(&layers).unwrap();
        let expected = c1 + (1.0 - c1.w) * (c2 + (1.0 - c2.w) * c3);
        for i in 0..4 {
            assert_relative_eq!(resolved[i], expected[i], epsilon = 1e-6);
        }

        let background = Vec4::new(0.1, 0.2, 0.3, 1.0);
        let final_color = blend_over(resolved, background);
        assert_relative_eq!(final_color.w, 1.0, epsilon = 1e-6);
        assert_relative_eq!(
            final_color.z,
            expected.z + (1.0 - expected.w) * 0.3,
            epsilon = 1e-6
        );
    }

    #[test]
    fn no_live_layers_keeps_background() {
        assert!(resolve_layers(&[Layer::EMPTY; LAYER_COUNT]).is_none());
        assert!(resolve_layers(&[]).is_none());
    }

    #[test]
    fn nearest_k_wins_on_overflow() {
        let mut list = LayerList::default();
        let color = Vec4::splat(0.5);
        for (i, distance) in [5.0, 1.0, 4.0, 3.0, 2.0, 6.0].into_iter().enumerate() {
            list.insert(encode_layer_key(distance, i as u32), color);
        }
        let kept: Vec<u32> = list.live().map(|l| decode_layer_key(l.key).1).collect();
        assert_eq!(kept, vec![1, 4, 3, 2]);
        assert!(!list.insert(encode_layer_key(10.0, 9), color));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let keys: Vec<u32> = (0..6).map(|v| encode_layer_key(v as f32, v)).collect();
        let mut forward = LayerList::default();
        let mut backward = LayerList::default();
        for &key in &keys {
            forward.insert(key, Vec4::ONE);
        }
        for &key in keys.iter().rev() {
            backward.insert(key, Vec4::ONE);
        }
        assert_eq!(forward, backward);
        assert_eq!(forward.live().count(), LAYER_COUNT);
    }
}
