use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};
use crate::types::Stage;

/// Top-level Stratum configuration.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub experience: ExperienceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub roster: RosterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_reward_threshold")]
    pub reward_threshold: f64,
    /// Whole-run timeout. Zero disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_learning: bool,
    #[serde(default)]
    pub enable_streaming: bool,
    /// Experiences required in the store before a learning step runs.
    #[serde(default = "default_learning_batch")]
    pub batch_size: usize,
    /// Discount applied when back-propagating rewards over the topology.
    #[serde(default = "default_graph_discount")]
    pub graph_discount: f64,
    /// Weight of a propagated reward when refreshing a node's value estimate.
    #[serde(default = "default_value_blend")]
    pub value_blend: f64,
}

fn default_max_iterations() -> usize {
    3
}
fn default_reward_threshold() -> f64 {
    0.6
}
fn default_timeout_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}
fn default_learning_batch() -> usize {
    32
}
fn default_graph_discount() -> f64 {
    0.9
}
fn default_value_blend() -> f64 {
    0.1
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            reward_threshold: default_reward_threshold(),
            timeout_secs: default_timeout_secs(),
            enable_learning: true,
            enable_streaming: false,
            batch_size: default_learning_batch(),
            graph_discount: default_graph_discount(),
            value_blend: default_value_blend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Use the sum-tree priority sampler instead of uniform sampling.
    #[serde(default)]
    pub prioritized: bool,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_beta_increment")]
    pub beta_increment: f64,
    #[serde(default = "default_priority_epsilon")]
    pub epsilon: f64,
    /// Fixed RNG seed for reproducible sampling.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_capacity() -> usize {
    10_000
}
fn default_alpha() -> f64 {
    0.6
}
fn default_beta() -> f64 {
    0.4
}
fn default_beta_increment() -> f64 {
    0.001
}
fn default_priority_epsilon() -> f64 {
    1e-6
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            prioritized: false,
            alpha: default_alpha(),
            beta: default_beta(),
            beta_increment: default_beta_increment(),
            epsilon: default_priority_epsilon(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_clip_epsilon")]
    pub clip_epsilon: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_gae_lambda")]
    pub gae_lambda: f64,
    /// Minimum transitions an agent needs in a batch to be updated.
    #[serde(default = "default_agent_batch")]
    pub batch_size: usize,
    #[serde(default = "default_adam_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_adam_beta2")]
    pub adam_beta2: f64,
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
    #[serde(default = "default_update_history")]
    pub max_history: usize,
    #[serde(default = "default_exploration_decay")]
    pub exploration_decay: f64,
    #[serde(default = "default_min_exploration")]
    pub min_exploration: f64,
}

fn default_learning_rate() -> f64 {
    0.001
}
fn default_clip_epsilon() -> f64 {
    0.2
}
fn default_gamma() -> f64 {
    0.99
}
fn default_gae_lambda() -> f64 {
    0.95
}
fn default_agent_batch() -> usize {
    4
}
fn default_adam_beta1() -> f64 {
    0.9
}
fn default_adam_beta2() -> f64 {
    0.999
}
fn default_adam_epsilon() -> f64 {
    1e-8
}
fn default_update_history() -> usize {
    1000
}
fn default_exploration_decay() -> f64 {
    0.995
}
fn default_min_exploration() -> f64 {
    0.01
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            clip_epsilon: default_clip_epsilon(),
            gamma: default_gamma(),
            gae_lambda: default_gae_lambda(),
            batch_size: default_agent_batch(),
            adam_beta1: default_adam_beta1(),
            adam_beta2: default_adam_beta2(),
            adam_epsilon: default_adam_epsilon(),
            max_history: default_update_history(),
            exploration_decay: default_exploration_decay(),
            min_exploration: default_min_exploration(),
        }
    }
}

/// Relative weight of each stage in the run-level reward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageWeights {
    #[serde(default = "default_decision_weight")]
    pub decision: f64,
    #[serde(default = "default_implementation_weight")]
    pub implementation: f64,
    #[serde(default = "default_validation_weight")]
    pub validation: f64,
}

fn default_decision_weight() -> f64 {
    0.3
}
fn default_implementation_weight() -> f64 {
    0.4
}
fn default_validation_weight() -> f64 {
    0.3
}

impl StageWeights {
    pub fn get(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Decision => self.decision,
            Stage::Implementation => self.implementation,
            Stage::Validation => self.validation,
        }
    }
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            decision: default_decision_weight(),
            implementation: default_implementation_weight(),
            validation: default_validation_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default)]
    pub stage_weights: StageWeights,
    /// Per-component weight overrides keyed by component name
    /// (e.g. `decision_quality = 0.5`).
    #[serde(default)]
    pub component_weights: BTreeMap<String, f64>,
    /// Share of the weighted stage reward in the blended run reward;
    /// the validation signal gets the remainder.
    #[serde(default = "default_weighted_share")]
    pub weighted_share: f64,
    #[serde(default = "default_gamma")]
    pub discount: f64,
    #[serde(default = "default_reward_history")]
    pub max_history: usize,
}

fn default_weighted_share() -> f64 {
    0.7
}
fn default_reward_history() -> usize {
    1000
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            stage_weights: StageWeights::default(),
            component_weights: BTreeMap::new(),
            weighted_share: default_weighted_share(),
            discount: default_gamma(),
            max_history: default_reward_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Stage numbers hosted by this bus.
    #[serde(default = "default_bus_stages")]
    pub stages: Vec<u8>,
    #[serde(default = "default_bus_history")]
    pub max_history: usize,
    /// Timeout for `send_and_wait` when the caller's contract has none.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_bus_stages() -> Vec<u8> {
    vec![1, 2, 3]
}
fn default_bus_history() -> usize {
    10_000
}
fn default_response_timeout() -> u64 {
    30
}

impl BusConfig {
    /// Hosted stages; unknown numbers are skipped (`validate` reports them).
    pub fn hosted_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter_map(|n| Stage::from_number(*n))
            .collect()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stages: default_bus_stages(),
            max_history: default_bus_history(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_feedback_history")]
    pub max_history: usize,
    /// Suggestions at or above this priority are folded into the next task.
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: i32,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
}

fn default_feedback_history() -> usize {
    100
}
fn default_priority_threshold() -> i32 {
    7
}
fn default_max_suggestions() -> usize {
    3
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_history: default_feedback_history(),
            priority_threshold: default_priority_threshold(),
            max_suggestions: default_max_suggestions(),
        }
    }
}

/// Agent roster per stage. Implementation agents come in groups that
/// coordinate internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    #[serde(default = "default_decision_roster")]
    pub decision: Vec<String>,
    #[serde(default = "default_implementation_groups")]
    pub implementation_groups: Vec<Vec<String>>,
    #[serde(default = "default_validation_roster")]
    pub validation: Vec<String>,
}

fn default_decision_roster() -> Vec<String> {
    vec!["strategist".into(), "critic".into()]
}
fn default_implementation_groups() -> Vec<Vec<String>> {
    vec![
        vec!["architect".into(), "developer".into()],
        vec!["tester".into()],
    ]
}
fn default_validation_roster() -> Vec<String> {
    vec!["inspector".into()]
}

impl RosterConfig {
    /// All agent ids of one stage, in roster order.
    pub fn agents(&self, stage: Stage) -> Vec<String> {
        match stage {
            Stage::Decision => self.decision.clone(),
            Stage::Implementation => self.implementation_groups.iter().flatten().cloned().collect(),
            Stage::Validation => self.validation.clone(),
        }
    }
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            decision: default_decision_roster(),
            implementation_groups: default_implementation_groups(),
            validation: default_validation_roster(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "stratum=info,warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StratumError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StratumError::Config(e.to_string()))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let o = &self.orchestrator;
        if o.max_iterations == 0 {
            problems.push("orchestrator.max_iterations must be at least 1".to_string());
        }
        if !(-1.0..=1.0).contains(&o.reward_threshold) {
            problems.push("orchestrator.reward_threshold must be within [-1, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&o.graph_discount) {
            problems.push("orchestrator.graph_discount must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&o.value_blend) {
            problems.push("orchestrator.value_blend must be within [0, 1]".to_string());
        }

        let e = &self.experience;
        if e.capacity == 0 {
            problems.push("experience.capacity must be at least 1".to_string());
        }
        if !(e.alpha >= 0.0 && e.alpha.is_finite()) {
            problems.push("experience.alpha must be non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&e.beta) {
            problems.push("experience.beta must be within [0, 1]".to_string());
        }
        if e.epsilon <= 0.0 {
            problems.push("experience.epsilon must be positive".to_string());
        }

        let p = &self.policy;
        if !(p.clip_epsilon > 0.0 && p.clip_epsilon < 1.0) {
            problems.push("policy.clip_epsilon must be within (0, 1)".to_string());
        }
        for (name, v) in [("gamma", p.gamma), ("gae_lambda", p.gae_lambda)] {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("policy.{} must be within [0, 1]", name));
            }
        }
        if p.batch_size == 0 {
            problems.push("policy.batch_size must be at least 1".to_string());
        }

        let r = &self.reward;
        for stage in Stage::ALL {
            let w = r.stage_weights.get(stage);
            if !(w >= 0.0 && w.is_finite()) {
                problems.push(format!("reward.stage_weights.{} must be non-negative", stage));
            }
        }
        if !(0.0..=1.0).contains(&r.weighted_share) {
            problems.push("reward.weighted_share must be within [0, 1]".to_string());
        }

        if self.bus.stages.is_empty() {
            problems.push("bus.stages must host at least one stage".to_string());
        }
        for n in &self.bus.stages {
            if Stage::from_number(*n).is_none() {
                problems.push(format!("bus.stages contains unknown stage {}", n));
            }
        }

        for stage in Stage::ALL {
            if self.roster.agents(stage).is_empty() {
                problems.push(format!("roster.{} has no agents", stage));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StratumError::Config(problems.join("; ")))
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
