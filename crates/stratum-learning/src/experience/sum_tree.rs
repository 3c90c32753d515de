//! Array-backed binary sum tree with a companion min tree.
//!
//! Leaves live at `position + capacity`, the parent of `idx` is `idx / 2`
//! and the root is index 1. Index 0 is unused.

#[derive(Debug, Clone)]
pub struct SumTree {
    capacity: usize,
    sums: Vec<f64>,
    mins: Vec<f64>,
}

impl SumTree {
    /// Tree with room for at least `leaves` leaves, rounded up to a power of two.
    pub fn new(leaves: usize) -> Self {
        let capacity = leaves.max(1).next_power_of_two();
        Self {
            capacity,
            sums: vec![0.0; 2 * capacity],
            mins: vec![f64::INFINITY; 2 * capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of all leaves.
    pub fn total(&self) -> f64 {
        self.sums[1]
    }

    /// Smallest written leaf, `INFINITY` when nothing has been written.
    pub fn min(&self) -> f64 {
        self.mins[1]
    }

    pub fn get(&self, position: usize) -> f64 {
        self.sums[position + self.capacity]
    }

    /// Write a leaf and refresh every ancestor up to the root.
    pub fn set(&mut self, position: usize, value: f64) {
        let mut idx = position + self.capacity;
        self.sums[idx] = value;
        self.mins[idx] = value;
        while idx > 1 {
            idx /= 2;
            let (left, right) = (2 * idx, 2 * idx + 1);
            self.sums[idx] = self.sums[left] + self.sums[right];
            self.mins[idx] = self.mins[left].min(self.mins[right]);
        }
    }

    /// Descend from the root to the leaf whose cumulative range holds `value`.
    ///
    /// `value <= left` goes left, otherwise `left` is subtracted and the
    /// descent continues right. Returns a leaf position.
    pub fn retrieve(&self, mut value: f64) -> usize {
        let mut idx = 1;
        while idx < self.capacity {
            let left = 2 * idx;
            if value <= self.sums[left] {
                idx = left;
            } else {
                value -= self.sums[left];
                idx = left + 1;
            }
        }
        idx - self.capacity
    }

    pub fn clear(&mut self) {
        self.sums.iter_mut().for_each(|v| *v = 0.0);
        self.mins.iter_mut().for_each(|v| *v = f64::INFINITY);
    }
}
