use rand::Rng;
use stratum_core::config::ExperienceConfig;
use stratum_core::Transition;

use super::buffer::{BufferStats, ExperienceBuffer};
use super::sum_tree::SumTree;

/// A prioritized draw: transitions, their buffer slots, and importance weights.
#[derive(Debug, Clone, Default)]
pub struct PrioritizedSample {
    pub transitions: Vec<Transition>,
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Ring buffer whose sampling probability is proportional to `priority^alpha`.
pub struct PrioritizedBuffer {
    buffer: ExperienceBuffer,
    tree: SumTree,
    alpha: f64,
    beta: f64,
    beta_increment: f64,
    epsilon: f64,
    max_priority: f64,
}

impl PrioritizedBuffer {
    pub fn new(capacity: usize, alpha: f64, beta: f64, beta_increment: f64, seed: Option<u64>) -> Self {
        let buffer = ExperienceBuffer::new(capacity, seed);
        let tree = SumTree::new(buffer.capacity());
        Self {
            buffer,
            tree,
            alpha,
            beta,
            beta_increment,
            epsilon: 1e-6,
            max_priority: 1.0,
        }
    }

    pub fn from_config(config: &ExperienceConfig) -> Self {
        let mut buf = Self::new(
            config.capacity,
            config.alpha,
            config.beta,
            config.beta_increment,
            config.seed,
        );
        buf.epsilon = config.epsilon;
        buf
    }

    /// Add with the highest priority seen so far.
    pub fn add(&mut self, transition: Transition) {
        let priority = self.max_priority;
        self.add_with_priority(transition, priority);
    }

    /// Add with an explicit priority. Magnitudes below epsilon are raised to
    /// it; NaN and infinite priorities fall back to the current maximum.
    pub fn add_with_priority(&mut self, transition: Transition, priority: f64) {
        let priority = if priority.is_finite() {
            priority.abs().max(self.epsilon)
        } else {
            self.max_priority
        };
        let slot = self.buffer.insert(transition);
        self.tree.set(slot, priority.powf(self.alpha));
        self.max_priority = self.max_priority.max(priority);
    }

    pub fn add_batch(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        for t in transitions {
            self.add(t);
        }
    }

    /// Stratified draw of `k` transitions.
    ///
    /// The total priority mass is split into `k` equal segments and one
    /// uniform value is drawn from each. With fewer than `k` stored items the
    /// whole buffer comes back with unit weights and β is left alone.
    pub fn sample(&mut self, k: usize) -> PrioritizedSample {
        let len = self.buffer.len();
        if len < k || k == 0 {
            return PrioritizedSample {
                transitions: self.buffer.get_recent(len),
                indices: self.chronological_slots(),
                weights: vec![1.0; len],
            };
        }

        let total = self.tree.total();
        let segment = total / k as f64;

        let mut indices = Vec::with_capacity(k);
        for i in 0..k {
            let low = segment * i as f64;
            let value = low + self.buffer.rng.gen::<f64>() * segment;
            let slot = self.tree.retrieve(value).min(len - 1);
            indices.push(slot);
        }

        let n = len as f64;
        let min_prob = (self.tree.min() / total).max(f64::MIN_POSITIVE);
        let max_weight = (n * min_prob).powf(-self.beta);
        let weights = indices
            .iter()
            .map(|&slot| {
                let prob = (self.tree.get(slot) / total).max(f64::MIN_POSITIVE);
                (n * prob).powf(-self.beta) / max_weight
            })
            .collect();

        self.beta = (self.beta + self.beta_increment).min(1.0);
        self.buffer.note_sampled(k);

        let transitions = indices
            .iter()
            .filter_map(|&slot| self.buffer.get(slot).cloned())
            .collect();
        PrioritizedSample {
            transitions,
            indices,
            weights,
        }
    }

    /// Rewrite the priorities of previously sampled slots.
    ///
    /// Priorities are taken as magnitudes and offset by epsilon so no stored
    /// item becomes unreachable. Out-of-range slots are ignored.
    pub fn update_priorities(&mut self, indices: &[usize], priorities: &[f64]) {
        for (&slot, &priority) in indices.iter().zip(priorities) {
            if slot >= self.buffer.len() || !priority.is_finite() {
                continue;
            }
            let priority = priority.abs() + self.epsilon;
            self.tree.set(slot, priority.powf(self.alpha));
            self.max_priority = self.max_priority.max(priority);
        }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn max_priority(&self) -> f64 {
        self.max_priority
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    pub fn get_recent(&self, n: usize) -> Vec<Transition> {
        self.buffer.get_recent(n)
    }

    pub fn stats(&self) -> &BufferStats {
        self.buffer.stats()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.tree.clear();
        self.max_priority = 1.0;
    }

    // Slots in the same order `get_recent(len)` returns transitions.
    fn chronological_slots(&self) -> Vec<usize> {
        let len = self.buffer.len();
        let start = if self.buffer.is_full() {
            self.buffer.insert_position()
        } else {
            0
        };
        (0..len).map(|offset| (start + offset) % len.max(1)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{AgentAction, Stage};

    fn t(reward: f64) -> Transition {
        Transition::new(Stage::Validation, "inspector", AgentAction::Validate, reward)
    }

    #[test]
    fn new_items_take_max_priority() {
        let mut buf = PrioritizedBuffer::new(8, 1.0, 0.4, 0.001, Some(1));
        buf.add(t(0.0));
        buf.update_priorities(&[0], &[5.0]);
        buf.add(t(0.0));
        assert!((buf.max_priority() - 5.0).abs() < 1e-5);
        assert!((buf.tree.get(1) - buf.tree.get(0)).abs() < 1e-9);
    }

    #[test]
    fn small_buffer_returns_everything_with_unit_weights() {
        let mut buf = PrioritizedBuffer::new(8, 0.6, 0.4, 0.1, Some(1));
        buf.add(t(1.0));
        buf.add(t(2.0));
        let sample = buf.sample(4);
        assert_eq!(sample.transitions.len(), 2);
        assert_eq!(sample.indices, vec![0, 1]);
        assert_eq!(sample.weights, vec![1.0, 1.0]);
        assert_eq!(buf.beta(), 0.4);
    }

    #[test]
    fn beta_anneals_and_caps() {
        let mut buf = PrioritizedBuffer::new(4, 0.6, 0.95, 0.04, Some(1));
        for i in 0..4 {
            buf.add(t(i as f64));
        }
        buf.sample(2);
        assert!((buf.beta() - 0.99).abs() < 1e-12);
        buf.sample(2);
        assert_eq!(buf.beta(), 1.0);
    }

    #[test]
    fn weights_are_normalized_to_at_most_one() {
        let mut buf = PrioritizedBuffer::new(4, 1.0, 0.5, 0.0, Some(9));
        for i in 0..4 {
            buf.add(t(i as f64));
        }
        buf.update_priorities(&[0, 1, 2, 3], &[1.0, 2.0, 4.0, 8.0]);
        let sample = buf.sample(4);
        assert_eq!(sample.weights.len(), 4);
        for (slot, w) in sample.indices.iter().zip(&sample.weights) {
            assert!(*w > 0.0 && *w <= 1.0 + 1e-12);
            if *slot == 0 {
                assert!((w - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn wrapped_high_priority_slot_dominates() {
        let mut buf = PrioritizedBuffer::new(4, 1.0, 0.4, 0.0, Some(42));
        for i in 0..4 {
            buf.add_with_priority(t(i as f64), 1.0);
        }
        // Fifth item wraps into slot 0.
        buf.add_with_priority(t(99.0), 100.0);
        assert_eq!(buf.len(), 4);

        let draws = 20_000;
        let mut hits = 0;
        for _ in 0..draws {
            let sample = buf.sample(1);
            if sample.indices[0] == 0 {
                hits += 1;
            }
        }
        let freq = hits as f64 / draws as f64;
        assert!((freq - 100.0 / 103.0).abs() < 0.01, "freq = {}", freq);
    }

    #[test]
    fn sampling_frequency_tracks_priorities() {
        let alpha = 0.6;
        let priorities = [1.0, 2.0, 3.0, 4.0];
        let mut buf = PrioritizedBuffer::new(4, alpha, 0.4, 0.0, Some(5));
        for (i, p) in priorities.iter().enumerate() {
            buf.add_with_priority(t(i as f64), *p);
        }

        let mass: f64 = priorities.iter().map(|p: &f64| p.powf(alpha)).sum();
        let mut counts = [0usize; 4];
        let draws = 40_000;
        for _ in 0..draws {
            counts[buf.sample(1).indices[0]] += 1;
        }
        for (i, p) in priorities.iter().enumerate() {
            let expected = p.powf(alpha) / mass;
            let observed = counts[i] as f64 / draws as f64;
            assert!((expected - observed).abs() < 0.015, "slot {}: {} vs {}", i, observed, expected);
        }
    }

    #[test]
    fn update_ignores_out_of_range_slots() {
        let mut buf = PrioritizedBuffer::new(4, 1.0, 0.4, 0.0, Some(1));
        buf.add(t(0.0));
        let before = buf.tree.total();
        buf.update_priorities(&[3], &[50.0]);
        assert_eq!(buf.tree.total(), before);
    }

    #[test]
    fn invalid_priorities_keep_the_tree_sound() {
        let mut buf = PrioritizedBuffer::new(4, 1.0, 0.4, 0.001, Some(5));
        buf.add_with_priority(t(0.0), 0.0);
        buf.add_with_priority(t(0.0), -2.0);
        buf.add_with_priority(t(0.0), f64::NAN);
        buf.add_with_priority(t(0.0), f64::INFINITY);

        assert!((buf.tree.get(0) - 1e-6).abs() < 1e-12);
        assert!((buf.tree.get(1) - 2.0).abs() < 1e-12);
        assert!((buf.tree.get(2) - 2.0).abs() < 1e-12);
        assert!((buf.tree.get(3) - 2.0).abs() < 1e-12);
        assert!(buf.tree.total().is_finite());
        assert!(buf.tree.min() > 0.0);
        assert_eq!(buf.max_priority(), 2.0);

        let sample = buf.sample(4);
        assert_eq!(sample.indices.len(), 4);
        assert!(sample.weights.iter().all(|w| w.is_finite() && *w > 0.0));
    }
}
