//! Triple-buffered frame ring and frame index discipline.
//!
//! Every piece of GPU state written by the CPU once per frame lives in a
//! [`FrameRing`]. The slot for frame `f` is only rewritten when `f` comes round
//! again, `FRAME_COUNT` frames later, by which time the caller's fence wait has
//! retired the GPU work that read it.

use crate::error::{Error, Result};
use std::ops::{Index, IndexMut};

/// Number of frames that may be in flight at once.
pub const FRAME_COUNT: usize = 3;

/// A validated frame index in `[0, FRAME_COUNT)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(u8);

impl FrameIndex {
    /// Validate a raw frame index.
    pub fn new(index: u8) -> Result<Self> {
        if usize::from(index) < FRAME_COUNT {
            Ok(Self(index))
        } else {
            Err(Error::OutOfBounds(format!(
                "frame index {index} must be below {FRAME_COUNT}"
            )))
        }
    }

    /// The frame index that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self((self.0 + 1) % FRAME_COUNT as u8)
    }

    /// Raw index as a `usize` for slot lookups.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Raw index.
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// All frame indices in order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..FRAME_COUNT as u8).map(Self)
    }
}

/// Fixed-size ring holding one `T` per in-flight frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRing<T> {
    slots: [T; FRAME_COUNT],
}

impl<T> FrameRing<T> {
    /// Build a ring by calling `f` once per slot.
    pub fn from_fn(f: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: std::array::from_fn(f),
        }
    }

    /// Build a ring with a fallible constructor, stopping at the first error.
    ///
    /// Slots created before the failure are handed to `cleanup`.
    pub fn try_from_fn<E>(
        mut f: impl FnMut(usize) -> std::result::Result<T, E>,
        mut cleanup: impl FnMut(T),
    ) -> std::result::Result<Self, E> {
        Self::try_from_fn_in(&mut (), |(), i| f(i), |(), value| cleanup(value))
    }

    /// Like [`FrameRing::try_from_fn`], threading a mutable context (such as
    /// an allocator) through both the constructor and the cleanup.
    pub fn try_from_fn_in<C: ?Sized, E>(
        ctx: &mut C,
        mut f: impl FnMut(&mut C, usize) -> std::result::Result<T, E>,
        mut cleanup: impl FnMut(&mut C, T),
    ) -> std::result::Result<Self, E> {
        let mut built = Vec::with_capacity(FRAME_COUNT);
        for i in 0..FRAME_COUNT {
            match f(ctx, i) {
                Ok(value) => built.push(value),
                Err(e) => {
                    for value in built {
                        cleanup(ctx, value);
                    }
                    return Err(e);
                }
            }
        }
        match built.try_into() {
            Ok(slots) => Ok(Self { slots }),
            Err(_) => unreachable!("exactly FRAME_COUNT slots were built"),
        }
    }

    /// Slot for a frame.
    #[inline]
    pub fn get(&self, frame: FrameIndex) -> &T {
        &self.slots[frame.as_usize()]
    }

    /// Mutable slot for a frame.
    #[inline]
    pub fn get_mut(&mut self, frame: FrameIndex) -> &mut T {
        &mut self.slots[frame.as_usize()]
    }

    /// Iterate slots in frame order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Iterate slots mutably in frame order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.slots.iter_mut()
    }

    /// Map every slot into a new ring.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> FrameRing<U> {
        FrameRing {
            slots: self.slots.map(f),
        }
    }

    /// Consume the ring, yielding the slots.
    pub fn into_inner(self) -> [T; FRAME_COUNT] {
        self.slots
    }
}

impl<T: Default> Default for FrameRing<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<FrameIndex> for FrameRing<T> {
    type Output = T;

    fn index(&self, frame: FrameIndex) -> &T {
        self.get(frame)
    }
}

impl<T> IndexMut<FrameIndex> for FrameRing<T> {
    fn index_mut(&mut self, frame: FrameIndex) -> &mut T {
        self.get_mut(frame)
    }
}

/// Tracks the sequence of frame indices handed in by the caller.
///
/// Indices must cycle `0, 1, 2, 0, ...`. Repeating the current index is allowed
/// (several calls for the same frame); anything else is reported as a skip.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameClock {
    current: Option<FrameIndex>,
    frames: u64,
}

impl FrameClock {
    /// Create a clock that has not seen any frame yet.
    pub const fn new() -> Self {
        Self {
            current: None,
            frames: 0,
        }
    }

    /// Record the start of work for `frame`.
    ///
    /// Returns `false` if the index broke the monotonic cycle.
    pub fn advance(&mut self, frame: FrameIndex) -> bool {
        let in_sequence = match self.current {
            None => true,
            Some(current) => frame == current || frame == current.next(),
        };
        if !in_sequence {
            tracing::warn!(
                expected = self.current.map(|c| c.next().get()),
                got = frame.get(),
                "frame index out of sequence"
            );
        }
        if self.current != Some(frame) {
            self.frames += 1;
        }
        self.current = Some(frame);
        in_sequence
    }

    /// The most recent frame, if any.
    pub const fn current(&self) -> Option<FrameIndex> {
        self.current
    }

    /// Number of distinct frames started.
    pub const fn frames_started(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_validation() {
        assert!(FrameIndex::new(0).is_ok());
        assert!(FrameIndex::new(2).is_ok());
        assert!(FrameIndex::new(3).is_err());
        assert!(FrameIndex::new(255).is_err());
    }

    #[test]
    fn frame_index_wraps() {
        let last = FrameIndex::new(2).unwrap();
        assert_eq!(last.next(), FrameIndex::new(0).unwrap());
    }

    #[test]
    fn ring_slots_are_isolated() {
        let mut ring: FrameRing<u32> = FrameRing::default();
        let f1 = FrameIndex::new(1).unwrap();
        ring[f1] = 42;
        for frame in FrameIndex::all() {
            let expected = if frame == f1 { 42 } else { 0 };
            assert_eq!(ring[frame], expected);
        }
    }

    #[test]
    fn slot_is_reused_only_after_full_cycle() {
        // Simulate writes for frames 0..7, recording which frame last wrote each slot.
        let mut ring: FrameRing<Option<u64>> = FrameRing::default();
        let mut frame = FrameIndex::default();
        for n in 0..7u64 {
            if let Some(prev) = ring[frame] {
                assert_eq!(n - prev, FRAME_COUNT as u64);
            }
            ring[frame] = Some(n);
            frame = frame.next();
        }
    }

    #[test]
    fn try_from_fn_cleans_up_on_failure() {
        let mut cleaned = Vec::new();
        let result: std::result::Result<FrameRing<usize>, &str> = FrameRing::try_from_fn(
            |i| if i == 2 { Err("boom") } else { Ok(i) },
            |v| cleaned.push(v),
        );
        assert!(result.is_err());
        assert_eq!(cleaned, vec![0, 1]);
    }

    #[test]
    fn try_from_fn_in_shares_context() {
        let mut pool: Vec<usize> = Vec::new();
        let ring: std::result::Result<FrameRing<usize>, ()> = FrameRing::try_from_fn_in(
            &mut pool,
            |pool, i| {
                pool.push(i);
                Ok(i * 10)
            },
            |pool, v| pool.retain(|&x| x != v),
        );
        assert_eq!(ring.map(FrameRing::into_inner), Ok([0, 10, 20]));
        assert_eq!(pool, vec![0, 1, 2]);
    }

    #[test]
    fn clock_accepts_monotonic_cycle() {
        let mut clock = FrameClock::new();
        let mut frame = FrameIndex::default();
        for _ in 0..10 {
            assert!(clock.advance(frame));
            frame = frame.next();
        }
        assert_eq!(clock.frames_started(), 10);
    }

    #[test]
    fn clock_allows_repeat_but_flags_skip() {
        let mut clock = FrameClock::new();
        let f0 = FrameIndex::new(0).unwrap();
        let f2 = FrameIndex::new(2).unwrap();
        assert!(clock.advance(f0));
        assert!(clock.advance(f0));
        assert_eq!(clock.frames_started(), 1);
        assert!(!clock.advance(f2));
        assert_eq!(clock.current(), Some(f2));
    }
}
