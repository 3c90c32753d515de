pub mod advantage;
pub mod experience;
pub mod optimizer;
pub mod policy;
pub mod reward;

pub use advantage::AdvantageEstimator;
pub use experience::{ExperienceBuffer, ExperienceStore, PrioritizedBuffer, SampledBatch, TrajectoryRecorder};
pub use optimizer::AdamOptimizer;
pub use policy::{clipped_objective, PolicyUpdater, UpdateResult, UpdateStats};
pub use reward::{ComponentScorer, DefaultHeuristics, IterationReward, RewardAggregator, RewardComponent, RewardShaper};
