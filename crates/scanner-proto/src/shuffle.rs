//! Shuffled track ordering for the ambient player.
//!
//! The cursor walks a random permutation of `[0..n)`.  Walking past the end
//! draws a brand-new permutation instead of replaying the old one, so every
//! track is heard once before anything repeats.

use rand::seq::SliceRandom;
use rand::Rng;

/// Fresh random permutation of `0..count`.
pub fn shuffled_order<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(rng);
    order
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackCursor {
    order: Vec<usize>,
    position: usize,
}

impl PlaybackCursor {
    /// Replace the order with a fresh permutation of `count` tracks and
    /// rewind to the first entry.
    pub fn reset<R: Rng + ?Sized>(&mut self, count: usize, rng: &mut R) {
        self.order = shuffled_order(count, rng);
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Track index under the cursor.
    pub fn current(&self) -> Option<usize> {
        self.order.get(self.position).copied()
    }

    /// Step forward.  Stepping past the last entry regenerates the order.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        self.position += 1;
        if self.position >= self.order.len() {
            let count = self.order.len();
            self.reset(count, rng);
        }
        self.current()
    }

    /// Step back, wrapping to the end of the current order.
    pub fn retreat(&mut self) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        self.position = if self.position == 0 {
            self.order.len() - 1
        } else {
            self.position - 1
        };
        self.current()
    }
}
