use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_core::config::PolicyConfig;
use stratum_core::{AgentAction, PolicyStore, Stage, Transition, ValueFunction};
use tracing::{debug, info};

use crate::advantage::AdvantageEstimator;
use crate::optimizer::AdamOptimizer;

/// Preferences stay inside this band.
const PREFERENCE_RANGE: (f64, f64) = (0.1, 0.9);

/// Scale from advantage to the pseudo probability ratio.
const RATIO_SCALE: f64 = 0.1;

/// Outcome of one agent's policy update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub stage: Stage,
    pub agent_id: String,
    pub old_parameters: BTreeMap<String, f64>,
    pub new_parameters: BTreeMap<String, f64>,
    /// Mean absolute gradient over the updated parameters.
    pub loss: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageUpdateStats {
    pub count: usize,
    pub mean_loss: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateStats {
    pub total_updates: usize,
    pub mean_loss: f64,
    pub by_stage: BTreeMap<Stage, StageUpdateStats>,
}

/// Clipped surrogate `min(r·A, clip(r, 1−ε, 1+ε)·A)`.
pub fn clipped_objective(ratio: f64, advantage: f64, epsilon: f64) -> f64 {
    let clipped = ratio.clamp(1.0 - epsilon, 1.0 + epsilon);
    (ratio * advantage).min(clipped * advantage)
}

/// Gradient key for an action's parameter.
pub fn action_param(action: AgentAction) -> String {
    format!("action_{}", action)
}

/// Trust-region-clipped, Adam-driven update of per-agent policies.
pub struct PolicyUpdater {
    optimizer: AdamOptimizer,
    estimator: AdvantageEstimator,
    clip_epsilon: f64,
    batch_size: usize,
    max_history: usize,
    history: VecDeque<UpdateResult>,
}

impl PolicyUpdater {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            optimizer: AdamOptimizer::new(
                config.learning_rate,
                config.adam_beta1,
                config.adam_beta2,
                config.adam_epsilon,
            ),
            estimator: AdvantageEstimator::new(config.gamma, config.gae_lambda),
            clip_epsilon: config.clip_epsilon,
            batch_size: config.batch_size.max(1),
            max_history: config.max_history.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn estimator(&self) -> &AdvantageEstimator {
        &self.estimator
    }

    /// Raw advantages of `experiences` in the given order.
    pub fn advantages(&self, experiences: &[Transition], values: Option<&dyn ValueFunction>) -> Vec<f64> {
        self.estimator.compute(experiences, values)
    }

    /// Update every agent that has a policy in `policies` and at least
    /// `batch_size` transitions in `experiences`.
    ///
    /// Experiences are grouped by stage, then by agent. Agents without a
    /// policy, or with too few transitions, are skipped.
    pub fn update(
        &mut self,
        experiences: &[Transition],
        policies: &mut dyn PolicyStore,
        values: Option<&dyn ValueFunction>,
    ) -> Vec<UpdateResult> {
        if experiences.is_empty() {
            return Vec::new();
        }

        let mut groups: BTreeMap<(Stage, &str), Vec<&Transition>> = BTreeMap::new();
        for t in experiences {
            groups.entry((t.stage, t.agent_id.as_str())).or_default().push(t);
        }

        let mut results = Vec::new();
        for ((stage, agent_id), batch) in groups {
            if batch.len() < self.batch_size {
                debug!(stage = %stage, agent = agent_id, size = batch.len(), "Batch too small, skipping");
                continue;
            }
            let Some(policy) = policies.policy_mut(agent_id) else {
                debug!(agent = agent_id, "No policy registered, skipping");
                continue;
            };

            let owned: Vec<Transition> = batch.into_iter().cloned().collect();
            let advantages = AdvantageEstimator::normalize(&self.estimator.compute(&owned, values));

            // Per-action objective sums and advantage lists.
            let mut objectives: BTreeMap<AgentAction, f64> = BTreeMap::new();
            let mut action_advantages: BTreeMap<AgentAction, Vec<f64>> = BTreeMap::new();
            for (t, &adv) in owned.iter().zip(&advantages) {
                let ratio = 1.0 + adv * RATIO_SCALE;
                *objectives.entry(t.action).or_insert(0.0) += clipped_objective(ratio, adv, self.clip_epsilon);
                action_advantages.entry(t.action).or_default().push(adv);
            }

            let old_parameters = policy.parameters.clone();
            let n = owned.len() as f64;
            let mut total_grad = 0.0;
            for (action, sum) in &objectives {
                let gradient = sum / n;
                let param = action_param(*action);
                let step = self
                    .optimizer
                    .compute_update(gradient, &format!("{}.{}", agent_id, param));
                *policy.parameters.entry(param).or_insert(0.0) += step;
                total_grad += gradient.abs();
            }

            for (action, advs) in &action_advantages {
                let mean = advs.iter().sum::<f64>() / advs.len() as f64;
                let current = policy.preference(*action);
                let updated = current + policy.learning_rate * mean * 0.1;
                policy
                    .action_preferences
                    .insert(*action, updated.clamp(PREFERENCE_RANGE.0, PREFERENCE_RANGE.1));
            }
            policy.touch();

            let loss = if objectives.is_empty() {
                0.0
            } else {
                total_grad / objectives.len() as f64
            };
            let result = UpdateResult {
                stage,
                agent_id: agent_id.to_string(),
                old_parameters,
                new_parameters: policy.parameters.clone(),
                loss,
                timestamp: Utc::now(),
            };
            debug!(stage = %stage, agent = agent_id, loss, "Policy updated");
            self.push_history(result.clone());
            results.push(result);
        }

        if !results.is_empty() {
            info!(updated = results.len(), batch = experiences.len(), "Policy update step");
        }
        results
    }

    /// Decay an agent's exploration rate, never below `min_rate`.
    pub fn decay_exploration(&self, policies: &mut dyn PolicyStore, agent_id: &str, decay: f64, min_rate: f64) -> bool {
        match policies.policy_mut(agent_id) {
            Some(policy) => {
                policy.decay_exploration(decay, min_rate);
                true
            }
            None => false,
        }
    }

    /// Set an agent's exploration rate, clamped to [0, 1].
    pub fn set_exploration_rate(&self, policies: &mut dyn PolicyStore, agent_id: &str, rate: f64) -> bool {
        match policies.policy_mut(agent_id) {
            Some(policy) => {
                policy.set_exploration_rate(rate);
                true
            }
            None => false,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &UpdateResult> {
        self.history.iter()
    }

    pub fn stats(&self) -> UpdateStats {
        if self.history.is_empty() {
            return UpdateStats::default();
        }
        let mut by_stage: BTreeMap<Stage, StageUpdateStats> = BTreeMap::new();
        for r in &self.history {
            let entry = by_stage.entry(r.stage).or_default();
            entry.count += 1;
            entry.mean_loss += r.loss;
        }
        for s in by_stage.values_mut() {
            s.mean_loss /= s.count as f64;
        }
        UpdateStats {
            total_updates: self.history.len(),
            mean_loss: self.history.iter().map(|r| r.loss).sum::<f64>() / self.history.len() as f64,
            by_stage,
        }
    }

    /// Forget optimizer moments and update history.
    pub fn reset(&mut self) {
        self.optimizer.reset();
        self.history.clear();
    }

    fn push_history(&mut self, result: UpdateResult) {
        self.history.push_back(result);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stratum_core::Policy;

    fn config(batch_size: usize) -> PolicyConfig {
        PolicyConfig {
            batch_size,
            learning_rate: 0.01,
            ..Default::default()
        }
    }

    fn t(agent: &str, action: AgentAction, reward: f64) -> Transition {
        Transition::new(Stage::Decision, agent, action, reward).terminal()
    }

    fn store() -> HashMap<String, Policy> {
        let mut policies = HashMap::new();
        policies.insert("strategist".to_string(), Policy::new("strategist", Stage::Decision).with_learning_rate(0.5));
        policies
    }

    #[test]
    fn objective_inside_band_is_ratio_times_advantage() {
        assert!((clipped_objective(1.1, 2.0, 0.2) - 2.2).abs() < 1e-12);
        assert!((clipped_objective(0.9, -1.0, 0.2) + 0.9).abs() < 1e-12);
    }

    #[test]
    fn objective_outside_band_uses_clipped_ratio() {
        // positive advantage, ratio above band: clip(1.5) = 1.2 is the minimum
        assert!((clipped_objective(1.5, 1.0, 0.2) - 1.2).abs() < 1e-12);
        // negative advantage, ratio below band: clipped -0.8 is below unclipped -0.5
        assert!((clipped_objective(0.5, -1.0, 0.2) + 0.8).abs() < 1e-12);
        // negative advantage, ratio above band: unclipped is the minimum
        assert!((clipped_objective(1.5, -1.0, 0.2) + 1.5).abs() < 1e-12);
    }

    #[test]
    fn empty_input_is_noop() {
        let mut updater = PolicyUpdater::new(&config(1));
        let mut policies = store();
        assert!(updater.update(&[], &mut policies, None).is_empty());
        assert_eq!(updater.stats().total_updates, 0);
    }

    #[test]
    fn small_batches_and_unknown_agents_are_skipped() {
        let mut updater = PolicyUpdater::new(&config(3));
        let mut policies = store();
        let batch = vec![
            t("strategist", AgentAction::Propose, 1.0),
            t("strategist", AgentAction::Propose, 0.0),
            t("ghost", AgentAction::Propose, 1.0),
            t("ghost", AgentAction::Propose, 1.0),
            t("ghost", AgentAction::Propose, 1.0),
        ];
        assert!(updater.update(&batch, &mut policies, None).is_empty());
        assert!(policies["strategist"].parameters.is_empty());
    }

    #[test]
    fn update_moves_parameters_and_preferences() {
        let mut updater = PolicyUpdater::new(&config(2));
        let mut policies = store();
        let batch = vec![
            t("strategist", AgentAction::Propose, 1.0),
            t("strategist", AgentAction::Propose, 0.8),
            t("strategist", AgentAction::Challenge, -1.0),
            t("strategist", AgentAction::Challenge, -0.6),
        ];
        let results = updater.update(&batch, &mut policies, None);
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.agent_id, "strategist");
        assert!(r.old_parameters.is_empty());
        assert!(r.loss > 0.0);

        let policy = &policies["strategist"];
        assert!(policy.parameters["action_propose"] > 0.0);
        assert!(policy.parameters["action_challenge"] < 0.0);
        assert!(policy.preference(AgentAction::Propose) > 0.5);
        assert!(policy.preference(AgentAction::Challenge) < 0.5);

        let stats = updater.stats();
        assert_eq!(stats.total_updates, 1);
        assert_eq!(stats.by_stage[&Stage::Decision].count, 1);
    }

    #[test]
    fn preferences_stay_in_band() {
        let mut updater = PolicyUpdater::new(&config(2));
        let mut policies = store();
        policies.get_mut("strategist").unwrap().learning_rate = 100.0;
        let batch = vec![
            t("strategist", AgentAction::Propose, 1.0),
            t("strategist", AgentAction::Challenge, -1.0),
        ];
        updater.update(&batch, &mut policies, None);
        let policy = &policies["strategist"];
        assert_eq!(policy.preference(AgentAction::Propose), 0.9);
        assert_eq!(policy.preference(AgentAction::Challenge), 0.1);
    }

    #[test]
    fn exploration_controls() {
        let updater = PolicyUpdater::new(&config(1));
        let mut policies = store();
        assert!(updater.set_exploration_rate(&mut policies, "strategist", 2.0));
        assert_eq!(policies["strategist"].exploration_rate, 1.0);
        assert!(updater.decay_exploration(&mut policies, "strategist", 0.5, 0.6));
        assert_eq!(policies["strategist"].exploration_rate, 0.6);
        assert!(!updater.set_exploration_rate(&mut policies, "ghost", 0.3));
    }

    #[test]
    fn reset_clears_history() {
        let mut updater = PolicyUpdater::new(&config(1));
        let mut policies = store();
        updater.update(&[t("strategist", AgentAction::Propose, 1.0)], &mut policies, None);
        assert_eq!(updater.history().count(), 1);
        updater.reset();
        assert_eq!(updater.history().count(), 0);
    }
}
