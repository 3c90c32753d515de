use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use stratum_core::config::{RewardConfig, StageWeights};
use stratum_core::{clamp_reward, DecisionOutput, ImplementationOutput, Stage, ValidationOutput};
use tracing::{debug, warn};

use super::components::{ComponentScorer, DefaultHeuristics, RewardComponent, ScoredOutput};

/// Weighted reward of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReward {
    pub stage: Stage,
    pub total: f64,
    pub components: BTreeMap<RewardComponent, f64>,
}

/// Reward of one full pipeline iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReward {
    /// Blended and clamped to [-1, 1].
    pub total: f64,
    /// Stage-weighted sum before blending with the validation signal.
    pub weighted: f64,
    pub stages: BTreeMap<Stage, StageReward>,
}

impl IterationReward {
    pub fn stage_total(&self, stage: Stage) -> f64 {
        self.stages.get(&stage).map_or(0.0, |s| s.total)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageRewardStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewardStats {
    pub total_signals: usize,
    /// Mean of the last 100 iteration rewards.
    pub recent_mean: Option<f64>,
    pub by_stage: BTreeMap<Stage, StageRewardStats>,
}

/// Turns stage outputs into scalar rewards.
pub struct RewardAggregator {
    stage_weights: StageWeights,
    component_weights: HashMap<RewardComponent, f64>,
    weighted_share: f64,
    discount: f64,
    scorer: Box<dyn ComponentScorer>,
    max_history: usize,
    history: VecDeque<f64>,
    stage_history: BTreeMap<Stage, VecDeque<f64>>,
}

impl RewardAggregator {
    pub fn new(config: &RewardConfig) -> Self {
        Self::with_scorer(config, Box::new(DefaultHeuristics))
    }

    pub fn with_scorer(config: &RewardConfig, scorer: Box<dyn ComponentScorer>) -> Self {
        let mut component_weights: HashMap<RewardComponent, f64> = RewardComponent::ALL
            .into_iter()
            .map(|c| (c, c.default_weight()))
            .collect();
        for (name, weight) in &config.component_weights {
            match RewardComponent::from_name(name) {
                Some(c) => {
                    component_weights.insert(c, *weight);
                }
                None => warn!(component = %name, "Unknown reward component in config, ignoring"),
            }
        }
        Self {
            stage_weights: config.stage_weights,
            component_weights,
            weighted_share: config.weighted_share,
            discount: config.discount,
            scorer,
            max_history: config.max_history.max(1),
            history: VecDeque::new(),
            stage_history: BTreeMap::new(),
        }
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    pub fn component_weight(&self, component: RewardComponent) -> f64 {
        self.component_weights.get(&component).copied().unwrap_or(0.0)
    }

    pub fn decision_reward(&mut self, output: &DecisionOutput) -> StageReward {
        let components = RewardComponent::for_stage(Stage::Decision)
            .map(|c| (c, self.scorer.score(c, ScoredOutput::Decision(output))))
            .collect();
        self.finish(Stage::Decision, components)
    }

    /// Component scores are averaged over the outputs; no outputs scores 0.
    pub fn implementation_reward(&mut self, outputs: &[ImplementationOutput]) -> StageReward {
        if outputs.is_empty() {
            return self.finish(Stage::Implementation, BTreeMap::new());
        }
        let n = outputs.len() as f64;
        let components = RewardComponent::for_stage(Stage::Implementation)
            .map(|c| {
                let sum: f64 = outputs
                    .iter()
                    .map(|o| self.scorer.score(c, ScoredOutput::Implementation(o)))
                    .sum();
                (c, sum / n)
            })
            .collect();
        self.finish(Stage::Implementation, components)
    }

    pub fn validation_reward(&mut self, output: &ValidationOutput) -> StageReward {
        let components = RewardComponent::for_stage(Stage::Validation)
            .map(|c| (c, self.scorer.score(c, ScoredOutput::Validation(output))))
            .collect();
        self.finish(Stage::Validation, components)
    }

    /// Score a whole iteration.
    ///
    /// The stage-weighted sum is blended with the validation signal,
    /// `share·weighted + (1 − share)·reward_signal`, then clamped to [-1, 1].
    pub fn compute(
        &mut self,
        decision: &DecisionOutput,
        implementations: &[ImplementationOutput],
        validation: &ValidationOutput,
    ) -> IterationReward {
        let stages: BTreeMap<Stage, StageReward> = [
            self.decision_reward(decision),
            self.implementation_reward(implementations),
            self.validation_reward(validation),
        ]
        .into_iter()
        .map(|r| (r.stage, r))
        .collect();

        let weighted: f64 = stages
            .values()
            .map(|r| r.total * self.stage_weights.get(r.stage))
            .sum();
        let blended = self.weighted_share * weighted + (1.0 - self.weighted_share) * validation.reward_signal;
        let total = clamp_reward(blended);

        debug!(weighted, signal = validation.reward_signal, total, "Iteration reward");
        self.history.push_back(total);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        IterationReward {
            total,
            weighted,
            stages,
        }
    }

    /// Spread a final reward back over the stages, validation first:
    /// stage `i` (1-based) receives `final · discount^(stage_count − i)`.
    pub fn propagate_reward(&self, final_reward: f64, discount: f64) -> Vec<(Stage, f64)> {
        let count = Stage::count() as i32;
        Stage::ALL
            .iter()
            .rev()
            .map(|&stage| {
                let exponent = count - stage.number() as i32;
                (stage, final_reward * discount.powi(exponent))
            })
            .collect()
    }

    /// Split the summed stage rewards over agents in proportion to their
    /// contribution. Non-positive total contribution yields nothing.
    pub fn propagate_to_agents(
        &self,
        stage_rewards: &[(Stage, f64)],
        contributions: &HashMap<String, f64>,
    ) -> HashMap<String, f64> {
        let total_contribution: f64 = contributions.values().sum();
        if total_contribution <= 0.0 {
            return HashMap::new();
        }
        let total_reward: f64 = stage_rewards.iter().map(|(_, r)| r).sum();
        contributions
            .iter()
            .map(|(agent, c)| (agent.clone(), total_reward * c / total_contribution))
            .collect()
    }

    pub fn stats(&self) -> RewardStats {
        let by_stage = self
            .stage_history
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(stage, h)| {
                let count = h.len();
                let stats = StageRewardStats {
                    count,
                    mean: h.iter().sum::<f64>() / count as f64,
                    min: h.iter().copied().fold(f64::INFINITY, f64::min),
                    max: h.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                (*stage, stats)
            })
            .collect();
        let recent: Vec<f64> = self.history.iter().rev().take(100).copied().collect();
        RewardStats {
            total_signals: self.history.len(),
            recent_mean: if recent.is_empty() {
                None
            } else {
                Some(recent.iter().sum::<f64>() / recent.len() as f64)
            },
            by_stage,
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.stage_history.clear();
    }

    fn finish(&mut self, stage: Stage, components: BTreeMap<RewardComponent, f64>) -> StageReward {
        let total = components
            .iter()
            .map(|(c, score)| score * self.component_weight(*c))
            .sum();
        let history = self.stage_history.entry(stage).or_default();
        history.push_back(total);
        while history.len() > self.max_history {
            history.pop_front();
        }
        StageReward {
            stage,
            total,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f64);

    impl ComponentScorer for Constant {
        fn score(&self, _: RewardComponent, _: ScoredOutput<'_>) -> f64 {
            self.0
        }
    }

    fn outputs() -> (DecisionOutput, Vec<ImplementationOutput>, ValidationOutput) {
        (
            DecisionOutput::new("strategist", "q"),
            vec![ImplementationOutput::new("developer", "t1")],
            ValidationOutput::new("inspector", 0.5),
        )
    }

    #[test]
    fn uniform_scores_blend_with_signal() {
        let mut agg = RewardAggregator::with_scorer(&RewardConfig::default(), Box::new(Constant(0.8)));
        let (d, i, v) = outputs();
        let reward = agg.compute(&d, &i, &v);
        // each stage totals 0.8, stage weights sum to 1
        assert!((reward.weighted - 0.8).abs() < 1e-12);
        assert!((reward.total - (0.7 * 0.8 + 0.3 * 0.5)).abs() < 1e-12);
        assert!((reward.stage_total(Stage::Implementation) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn total_is_clamped() {
        let mut agg = RewardAggregator::with_scorer(&RewardConfig::default(), Box::new(Constant(5.0)));
        let (d, i, mut v) = outputs();
        v.reward_signal = 4.0;
        assert_eq!(agg.compute(&d, &i, &v).total, 1.0);
    }

    #[test]
    fn default_heuristics_on_bare_outputs() {
        let mut agg = RewardAggregator::new(&RewardConfig::default());
        let (d, i, v) = outputs();
        let reward = agg.compute(&d, &i, &v);
        // decision: .4*.5 + .4*.5 + .2*.6 = .52
        assert!((reward.stage_total(Stage::Decision) - 0.52).abs() < 1e-12);
        // implementation: .3*.5 + .4*.5 + .3*.6 = .53
        assert!((reward.stage_total(Stage::Implementation) - 0.53).abs() < 1e-12);
        // validation: all components .5
        assert!((reward.stage_total(Stage::Validation) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn no_implementations_scores_zero() {
        let mut agg = RewardAggregator::new(&RewardConfig::default());
        let r = agg.implementation_reward(&[]);
        assert_eq!(r.total, 0.0);
        assert!(r.components.is_empty());
    }

    #[test]
    fn component_weight_overrides() {
        let mut config = RewardConfig::default();
        config.component_weights.insert("decision_innovation".into(), 0.0);
        config.component_weights.insert("bogus".into(), 3.0);
        let agg = RewardAggregator::new(&config);
        assert_eq!(agg.component_weight(RewardComponent::DecisionInnovation), 0.0);
        assert_eq!(agg.component_weight(RewardComponent::DecisionQuality), 0.4);
    }

    #[test]
    fn propagation_discounts_upstream_stages() {
        let agg = RewardAggregator::new(&RewardConfig::default());
        let spread = agg.propagate_reward(1.0, 0.9);
        assert_eq!(spread[0].0, Stage::Validation);
        assert!((spread[0].1 - 1.0).abs() < 1e-12);
        assert!((spread[1].1 - 0.9).abs() < 1e-12);
        assert_eq!(spread[2].0, Stage::Decision);
        assert!((spread[2].1 - 0.81).abs() < 1e-12);
    }

    #[test]
    fn agent_shares_follow_contribution() {
        let agg = RewardAggregator::new(&RewardConfig::default());
        let stages = vec![(Stage::Validation, 0.6), (Stage::Decision, 0.4)];
        let mut contributions = HashMap::new();
        contributions.insert("a".to_string(), 3.0);
        contributions.insert("b".to_string(), 1.0);
        let shares = agg.propagate_to_agents(&stages, &contributions);
        assert!((shares["a"] - 0.75).abs() < 1e-12);
        assert!((shares["b"] - 0.25).abs() < 1e-12);

        assert!(agg.propagate_to_agents(&stages, &HashMap::new()).is_empty());
    }

    #[test]
    fn stats_track_stages() {
        let mut agg = RewardAggregator::with_scorer(&RewardConfig::default(), Box::new(Constant(0.5)));
        let (d, i, v) = outputs();
        agg.compute(&d, &i, &v);
        agg.compute(&d, &i, &v);
        let stats = agg.stats();
        assert_eq!(stats.total_signals, 2);
        assert_eq!(stats.by_stage[&Stage::Decision].count, 2);
        assert!(stats.recent_mean.is_some());

        agg.clear_history();
        assert_eq!(agg.stats().total_signals, 0);
    }
}
