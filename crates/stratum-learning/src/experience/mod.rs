//! Experience replay: a uniform ring buffer, a sum-tree priority sampler,
//! and the trajectory recorder that feeds them.

pub mod buffer;
pub mod prioritized;
pub mod sum_tree;
pub mod trajectory;

pub use buffer::{BufferStats, ExperienceBuffer};
pub use prioritized::{PrioritizedBuffer, PrioritizedSample};
pub use sum_tree::SumTree;
pub use trajectory::{Trajectory, TrajectoryRecorder, TrajectoryStats};

use stratum_core::config::ExperienceConfig;
use stratum_core::Transition;

/// A sampled batch. `indices` is set only by the prioritized store.
#[derive(Debug, Clone, Default)]
pub struct SampledBatch {
    pub transitions: Vec<Transition>,
    pub indices: Option<Vec<usize>>,
    pub weights: Vec<f64>,
}

/// Either experience store variant behind one interface.
pub enum ExperienceStore {
    Uniform(ExperienceBuffer),
    Prioritized(PrioritizedBuffer),
}

impl ExperienceStore {
    pub fn from_config(config: &ExperienceConfig) -> Self {
        if config.prioritized {
            Self::Prioritized(PrioritizedBuffer::from_config(config))
        } else {
            Self::Uniform(ExperienceBuffer::new(config.capacity, config.seed))
        }
    }

    pub fn add(&mut self, transition: Transition) {
        match self {
            Self::Uniform(b) => b.add(transition),
            Self::Prioritized(b) => b.add(transition),
        }
    }

    pub fn add_batch(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        for t in transitions {
            self.add(t);
        }
    }

    pub fn sample(&mut self, k: usize) -> SampledBatch {
        match self {
            Self::Uniform(b) => {
                let transitions = b.sample(k);
                let weights = vec![1.0; transitions.len()];
                SampledBatch {
                    transitions,
                    indices: None,
                    weights,
                }
            }
            Self::Prioritized(b) => {
                let sample = b.sample(k);
                SampledBatch {
                    transitions: sample.transitions,
                    indices: Some(sample.indices),
                    weights: sample.weights,
                }
            }
        }
    }

    /// Refresh priorities after learning. Ignored by the uniform store.
    pub fn update_priorities(&mut self, indices: &[usize], priorities: &[f64]) {
        if let Self::Prioritized(b) = self {
            b.update_priorities(indices, priorities);
        }
    }

    pub fn get_recent(&self, n: usize) -> Vec<Transition> {
        match self {
            Self::Uniform(b) => b.get_recent(n),
            Self::Prioritized(b) => b.get_recent(n),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Uniform(b) => b.len(),
            Self::Prioritized(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_prioritized(&self) -> bool {
        matches!(self, Self::Prioritized(_))
    }

    pub fn stats(&self) -> &BufferStats {
        match self {
            Self::Uniform(b) => b.stats(),
            Self::Prioritized(b) => b.stats(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Self::Uniform(b) => b.clear(),
            Self::Prioritized(b) => b.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{AgentAction, Stage};

    #[test]
    fn store_variant_follows_config() {
        let mut config = ExperienceConfig::default();
        assert!(!ExperienceStore::from_config(&config).is_prioritized());
        config.prioritized = true;
        assert!(ExperienceStore::from_config(&config).is_prioritized());
    }

    #[test]
    fn uniform_batches_carry_unit_weights_and_no_indices() {
        let config = ExperienceConfig {
            capacity: 16,
            seed: Some(4),
            ..Default::default()
        };
        let mut store = ExperienceStore::from_config(&config);
        store.add_batch(
            (0..8).map(|i| Transition::new(Stage::Decision, "a", AgentAction::Propose, i as f64)),
        );
        let batch = store.sample(4);
        assert_eq!(batch.transitions.len(), 4);
        assert!(batch.indices.is_none());
        assert_eq!(batch.weights, vec![1.0; 4]);
        store.update_priorities(&[0], &[3.0]);
        assert_eq!(store.len(), 8);
    }
}
