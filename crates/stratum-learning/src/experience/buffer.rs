use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::Serialize;
use stratum_core::{Stage, Transition};

/// Counters kept by an experience store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub total_added: u64,
    pub total_sampled: u64,
    pub current_size: usize,
    pub capacity: usize,
    /// Running mean over every transition ever added, evicted ones included.
    pub mean_reward: f64,
    pub by_stage: BTreeMap<Stage, u64>,
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Fixed-capacity ring buffer of transitions with uniform sampling.
pub struct ExperienceBuffer {
    capacity: usize,
    items: Vec<Transition>,
    /// Next slot to write once the buffer is full.
    position: usize,
    pub(crate) rng: StdRng,
    stats: BufferStats,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Vec::with_capacity(capacity.min(1024)),
            position: 0,
            rng: make_rng(seed),
            stats: BufferStats {
                capacity,
                ..Default::default()
            },
        }
    }

    /// Append a transition, overwriting the oldest one when full.
    pub fn add(&mut self, transition: Transition) {
        self.insert(transition);
    }

    /// Store a transition and return the slot it landed in.
    pub(crate) fn insert(&mut self, transition: Transition) -> usize {
        let slot = self.position;
        self.record_stats(&transition);
        if self.items.len() < self.capacity {
            self.items.push(transition);
        } else {
            self.items[slot] = transition;
        }
        self.position = (self.position + 1) % self.capacity;
        self.stats.current_size = self.items.len();
        slot
    }

    pub fn add_batch(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        for t in transitions {
            self.add(t);
        }
    }

    /// `k` distinct transitions drawn uniformly, or everything when fewer are stored.
    pub fn sample(&mut self, k: usize) -> Vec<Transition> {
        if self.items.len() <= k {
            return self.items.clone();
        }
        let picked: Vec<Transition> = index::sample(&mut self.rng, self.items.len(), k)
            .into_iter()
            .map(|i| self.items[i].clone())
            .collect();
        self.stats.total_sampled += k as u64;
        picked
    }

    /// Uniform sample restricted to one stage.
    pub fn sample_by_stage(&mut self, stage: Stage, k: usize) -> Vec<Transition> {
        let matching: Vec<&Transition> = self.items.iter().filter(|t| t.stage == stage).collect();
        if matching.len() <= k {
            return matching.into_iter().cloned().collect();
        }
        index::sample(&mut self.rng, matching.len(), k)
            .into_iter()
            .map(|i| matching[i].clone())
            .collect()
    }

    /// The `n` most recent transitions, oldest first.
    pub fn get_recent(&self, n: usize) -> Vec<Transition> {
        let n = n.min(self.items.len());
        // Once full, chronological order starts at the write position.
        let start = if self.is_full() { self.position } else { 0 };
        let len = self.items.len();
        (len - n..len)
            .map(|offset| self.items[(start + offset) % len].clone())
            .collect()
    }

    pub fn get(&self, slot: usize) -> Option<&Transition> {
        self.items.get(slot)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.position = 0;
        self.stats = BufferStats {
            capacity: self.capacity,
            ..Default::default()
        };
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    pub(crate) fn insert_position(&self) -> usize {
        self.position
    }

    pub(crate) fn note_sampled(&mut self, k: usize) {
        self.stats.total_sampled += k as u64;
    }

    fn record_stats(&mut self, transition: &Transition) {
        let stats = &mut self.stats;
        stats.total_added += 1;
        *stats.by_stage.entry(transition.stage).or_insert(0) += 1;
        let n = stats.total_added as f64;
        stats.mean_reward += (transition.reward - stats.mean_reward) / n;
    }
}
