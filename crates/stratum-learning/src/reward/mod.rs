//! Reward scoring: per-stage component scores, the weighted run reward,
//! stage and agent propagation, and potential-based shaping.

pub mod aggregator;
pub mod components;
pub mod shaper;

pub use aggregator::{IterationReward, RewardAggregator, RewardStats, StageReward, StageRewardStats};
pub use components::{ComponentScorer, DefaultHeuristics, RewardComponent, ScoredOutput};
pub use shaper::RewardShaper;
