use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StratumError;

/// Short random identifier with a readable prefix, e.g. `exp_1a2b3c4d`.
pub fn short_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &uuid[..8])
}

/// Clamp a reward into the closed interval [-1, 1]. NaN collapses to 0.
pub fn clamp_reward(reward: f64) -> f64 {
    if reward.is_nan() {
        0.0
    } else {
        reward.clamp(-1.0, 1.0)
    }
}

/// Unique run/session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(short_id("session"))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the pipeline phases the orchestrator drives each iteration.
///
/// On the wire a stage is its number (1, 2, 3).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    Decision,
    Implementation,
    Validation,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Decision, Stage::Implementation, Stage::Validation];

    /// Stage number, 1-based, upstream first.
    pub fn number(self) -> u8 {
        match self {
            Stage::Decision => 1,
            Stage::Implementation => 2,
            Stage::Validation => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Stage::Decision),
            2 => Some(Stage::Implementation),
            3 => Some(Stage::Validation),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Decision => "decision",
            Stage::Implementation => "implementation",
            Stage::Validation => "validation",
        }
    }

    /// The stage directly upstream, used for escalation.
    pub fn upstream(self) -> Stage {
        match self {
            Stage::Decision | Stage::Implementation => Stage::Decision,
            Stage::Validation => Stage::Implementation,
        }
    }

    /// Number of stages in the pipeline.
    pub fn count() -> usize {
        Self::ALL.len()
    }
}

impl TryFrom<u8> for Stage {
    type Error = StratumError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Stage::from_number(n).ok_or(StratumError::InvalidStage(n))
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.number()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Action tag attached to a recorded transition.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    // Decision stage
    Propose,
    Evaluate,
    Synthesize,
    Challenge,
    // Implementation stage
    Design,
    Implement,
    Test,
    Coordinate,
    Document,
    // Validation stage
    Inspect,
    Validate,
    Report,
    Escalate,
}

impl AgentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentAction::Propose => "propose",
            AgentAction::Evaluate => "evaluate",
            AgentAction::Synthesize => "synthesize",
            AgentAction::Challenge => "challenge",
            AgentAction::Design => "design",
            AgentAction::Implement => "implement",
            AgentAction::Test => "test",
            AgentAction::Coordinate => "coordinate",
            AgentAction::Document => "document",
            AgentAction::Inspect => "inspect",
            AgentAction::Validate => "validate",
            AgentAction::Report => "report",
            AgentAction::Escalate => "escalate",
        }
    }

    /// The action a stage records when it produced its output normally.
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Decision => AgentAction::Propose,
            Stage::Implementation => AgentAction::Implement,
            Stage::Validation => AgentAction::Validate,
        }
    }
}

impl std::fmt::Display for AgentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque state snapshot. Ordered so that equal states produce equal keys.
pub type StateSnapshot = BTreeMap<String, serde_json::Value>;

/// Canonical lookup key for a state snapshot.
pub fn state_key(state: &StateSnapshot) -> String {
    serde_json::to_string(state).unwrap_or_default()
}

/// One observed (state, action, reward, next-state) tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub stage: Stage,
    pub agent_id: String,
    #[serde(default)]
    pub state: StateSnapshot,
    pub action: AgentAction,
    pub reward: f64,
    #[serde(default)]
    pub next_state: StateSnapshot,
    #[serde(default)]
    pub done: bool,
    pub timestamp: DateTime<Utc>,
}

impl Transition {
    pub fn new(stage: Stage, agent_id: impl Into<String>, action: AgentAction, reward: f64) -> Self {
        Self {
            id: short_id("exp"),
            stage,
            agent_id: agent_id.into(),
            state: StateSnapshot::new(),
            action,
            reward,
            next_state: StateSnapshot::new(),
            done: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_state(mut self, state: StateSnapshot) -> Self {
        self.state = state;
        self
    }

    pub fn with_next_state(mut self, next_state: StateSnapshot) -> Self {
        self.next_state = next_state;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Mutable per-agent parameters and action preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub agent_type: String,
    pub stage: Stage,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub action_preferences: BTreeMap<AgentAction, f64>,
    pub learning_rate: f64,
    pub exploration_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Preference assumed for an action the policy has never scored.
pub const NEUTRAL_PREFERENCE: f64 = 0.5;

impl Policy {
    pub fn new(agent_type: impl Into<String>, stage: Stage) -> Self {
        Self {
            policy_id: short_id("policy"),
            agent_type: agent_type.into(),
            stage,
            parameters: BTreeMap::new(),
            action_preferences: BTreeMap::new(),
            learning_rate: 0.001,
            exploration_rate: 0.1,
            last_updated: Utc::now(),
        }
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn preference(&self, action: AgentAction) -> f64 {
        self.action_preferences
            .get(&action)
            .copied()
            .unwrap_or(NEUTRAL_PREFERENCE)
    }

    /// Multiply the exploration rate by `decay`, never going below `min_rate`.
    pub fn decay_exploration(&mut self, decay: f64, min_rate: f64) {
        self.exploration_rate = (self.exploration_rate * decay).max(min_rate);
    }

    /// Set the exploration rate, clamped to [0, 1].
    pub fn set_exploration_rate(&mut self, rate: f64) {
        self.exploration_rate = rate.clamp(0.0, 1.0);
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Lifecycle of a single orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Converged,
    Exhausted,
    TimedOut,
    Failed,
}

/// Run-wide state owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    pub session_id: SessionId,
    pub iteration: usize,
    pub current_task: String,
    pub reward_history: Vec<f64>,
    /// Reward of the latest iteration.
    pub total_reward: f64,
    pub cumulative_reward: f64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl GlobalState {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            iteration: 0,
            current_task: task.into(),
            reward_history: Vec::new(),
            total_reward: 0.0,
            cumulative_reward: 0.0,
            status: RunStatus::Active,
            started_at: Utc::now(),
        }
    }

    /// Append an iteration reward (clamped) to the history.
    pub fn record_reward(&mut self, reward: f64) {
        let reward = clamp_reward(reward);
        self.reward_history.push(reward);
        self.total_reward = reward;
        self.cumulative_reward += reward;
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new("")
    }
}

/// Events published on the [`EventBus`](crate::event::EventBus) while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        session_id: SessionId,
        task: String,
    },
    IterationStarted {
        session_id: SessionId,
        iteration: usize,
    },
    StageChunk {
        stage: Stage,
        text: String,
    },
    StageCompleted {
        stage: Stage,
        iteration: usize,
        elapsed_ms: u64,
    },
    RewardComputed {
        iteration: usize,
        reward: f64,
        stage_rewards: HashMap<Stage, f64>,
    },
    PolicyUpdated {
        agents: Vec<String>,
        mean_loss: f64,
    },
    Converged {
        iteration: usize,
        reward: f64,
    },
    RunFinished {
        session_id: SessionId,
        status: RunStatus,
        iterations: usize,
        final_reward: f64,
    },
    RunFailed {
        session_id: SessionId,
        stage: Stage,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_serializes_as_number() {
        let json = serde_json::to_string(&Stage::Implementation).unwrap();
        assert_eq!(json, "2");
        let parsed: Stage = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Stage::Validation);
        assert!(serde_json::from_str::<Stage>("7").is_err());
    }

    #[test]
    fn stage_upstream() {
        assert_eq!(Stage::Validation.upstream(), Stage::Implementation);
        assert_eq!(Stage::Implementation.upstream(), Stage::Decision);
        assert_eq!(Stage::Decision.upstream(), Stage::Decision);
    }

    #[test]
    fn clamp_reward_bounds() {
        assert_eq!(clamp_reward(3.0), 1.0);
        assert_eq!(clamp_reward(-2.5), -1.0);
        assert_eq!(clamp_reward(0.25), 0.25);
        assert_eq!(clamp_reward(f64::NAN), 0.0);
    }

    #[test]
    fn state_key_is_order_independent() {
        let mut a = StateSnapshot::new();
        a.insert("b".into(), serde_json::json!(2));
        a.insert("a".into(), serde_json::json!(1));
        let mut b = StateSnapshot::new();
        b.insert("a".into(), serde_json::json!(1));
        b.insert("b".into(), serde_json::json!(2));
        assert_eq!(state_key(&a), state_key(&b));
    }

    #[test]
    fn policy_exploration() {
        let mut policy = Policy::new("decision", Stage::Decision);
        policy.set_exploration_rate(1.7);
        assert_eq!(policy.exploration_rate, 1.0);
        policy.set_exploration_rate(0.4);
        policy.set_exploration_rate(0.4);
        assert_eq!(policy.exploration_rate, 0.4);

        policy.decay_exploration(0.5, 0.3);
        assert_eq!(policy.exploration_rate, 0.3);
        assert_eq!(policy.preference(AgentAction::Propose), NEUTRAL_PREFERENCE);
    }

    #[test]
    fn global_state_records_clamped_rewards() {
        let mut state = GlobalState::new("task");
        state.record_reward(0.4);
        state.record_reward(5.0);
        assert_eq!(state.reward_history, vec![0.4, 1.0]);
        assert_eq!(state.total_reward, 1.0);
        assert!((state.cumulative_reward - 1.4).abs() < 1e-12);
    }

    #[test]
    fn short_id_has_prefix() {
        let id = short_id("msg");
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 12);
    }
}
