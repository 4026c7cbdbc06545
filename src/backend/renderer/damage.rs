//! Buffer-age aware damage accumulation
//!
//! Render surfaces reuse a small ring of buffers. A buffer handed out again still holds the
//! frame it was last used for, so only what changed since then needs to be repainted.
//! [`DamageRing`] remembers the damage of the last few frames and answers "what must be
//! redrawn on a buffer of age N".

use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::trace;

use crate::utils::{Physical, Rectangle, Size};

const MAX_AGE: usize = 4;

/// Damage history of one render surface
#[derive(Debug)]
pub struct DamageRing {
    size: Size<i32, Physical>,
    old_damage: VecDeque<SmallVec<[Rectangle<i32, Physical>; 4]>>,
}

impl DamageRing {
    /// Create an empty history for a surface of the given size
    pub fn new(size: Size<i32, Physical>) -> DamageRing {
        DamageRing {
            size,
            old_damage: VecDeque::with_capacity(MAX_AGE),
        }
    }

    /// Size of the tracked surface
    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    fn full(&self) -> Vec<Rectangle<i32, Physical>> {
        vec![Rectangle::from_size(self.size)]
    }

    /// Region that has to be repainted on a buffer of the given age
    ///
    /// An age of `0` means the buffer contents are undefined, which requires a full repaint, as
    /// does an age older than the recorded history. A buffer of age `1` holds the last frame and
    /// needs no repaint besides new damage, a buffer of age `n` misses the last `n - 1` frames.
    pub fn damage_since(&self, age: usize) -> Vec<Rectangle<i32, Physical>> {
        if age > 0 && self.old_damage.len() >= age - 1 {
            trace!("age of {} recent enough, using old damage", age);
            self.old_damage.iter().take(age - 1).flatten().copied().collect()
        } else {
            trace!(
                "no old damage available, re-render everything. age: {} old_damage len: {}",
                age,
                self.old_damage.len(),
            );
            self.full()
        }
    }

    /// Record the damage of a finished frame
    ///
    /// Rectangles are clamped to the surface, the ones outside are dropped.
    pub fn add(&mut self, damage: &[Rectangle<i32, Physical>]) {
        let bounds = Rectangle::from_size(self.size);
        let damage = damage
            .iter()
            .filter_map(|rect| rect.intersection(bounds))
            .collect::<SmallVec<_>>();
        self.old_damage.push_front(damage);
        self.old_damage.truncate(MAX_AGE);
    }

    /// Forget all history, the next frame of every age repaints everything
    pub fn reset(&mut self) {
        self.old_damage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Physical> {
        Rectangle::new((x, y).into(), (w, h).into())
    }

    #[test]
    fn undefined_buffer_repaints_everything() {
        let mut ring = DamageRing::new((100, 50).into());
        ring.add(&[rect(0, 0, 10, 10)]);
        assert_eq!(ring.damage_since(0), vec![rect(0, 0, 100, 50)]);
    }

    #[test]
    fn accumulates_damage_by_age() {
        let mut ring = DamageRing::new((100, 50).into());
        ring.add(&[rect(0, 0, 10, 10)]);
        ring.add(&[rect(20, 0, 10, 10)]);
        ring.add(&[rect(40, 0, 10, 10)]);

        assert!(ring.damage_since(1).is_empty());
        assert_eq!(ring.damage_since(2), vec![rect(40, 0, 10, 10)]);
        assert_eq!(
            ring.damage_since(3),
            vec![rect(40, 0, 10, 10), rect(20, 0, 10, 10)]
        );
        assert_eq!(
            ring.damage_since(4),
            vec![rect(40, 0, 10, 10), rect(20, 0, 10, 10), rect(0, 0, 10, 10)]
        );
        // older than the history
        assert_eq!(ring.damage_since(5), vec![rect(0, 0, 100, 50)]);
    }

    #[test]
    fn single_frame_of_history_serves_age_two() {
        let mut ring = DamageRing::new((100, 50).into());
        assert!(ring.damage_since(1).is_empty());
        assert_eq!(ring.damage_since(2), vec![rect(0, 0, 100, 50)]);

        ring.add(&[rect(5, 5, 10, 10)]);
        assert!(ring.damage_since(1).is_empty());
        assert_eq!(ring.damage_since(2), vec![rect(5, 5, 10, 10)]);
        assert_eq!(ring.damage_since(3), vec![rect(0, 0, 100, 50)]);
    }

    #[test]
    fn clamps_and_limits_history() {
        let mut ring = DamageRing::new((100, 50).into());
        ring.add(&[rect(90, 40, 20, 20), rect(200, 200, 5, 5)]);
        assert_eq!(ring.damage_since(2), vec![rect(90, 40, 10, 10)]);

        for _ in 0..10 {
            ring.add(&[]);
        }
        assert_eq!(ring.damage_since(MAX_AGE + 1), Vec::new());
        assert_eq!(ring.damage_since(MAX_AGE + 2), vec![rect(0, 0, 100, 50)]);

        ring.reset();
        assert_eq!(ring.damage_since(2), vec![rect(0, 0, 100, 50)]);
    }
}
