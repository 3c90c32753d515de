use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_core::{
    short_id, AgentAction, DecisionOutput, ImplementationOutput, SessionId, Stage, StateSnapshot,
    Transition, ValidationOutput,
};

/// One pass through the pipeline: its steps and the stage outputs behind them.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub trajectory_id: String,
    pub session_id: SessionId,
    pub query: String,
    pub iteration: usize,
    pub steps: Vec<Transition>,
    pub decision: Option<DecisionOutput>,
    pub implementations: Vec<ImplementationOutput>,
    pub validation: Option<ValidationOutput>,
    pub total_reward: f64,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trajectory {
    fn new(session_id: SessionId, query: String, iteration: usize) -> Self {
        Self {
            trajectory_id: short_id("traj"),
            session_id,
            query,
            iteration,
            steps: Vec::new(),
            decision: None,
            implementations: Vec::new(),
            validation: None,
            total_reward: 0.0,
            success: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn stage_steps(&self, stage: Stage) -> impl Iterator<Item = &Transition> {
        self.steps.iter().filter(move |s| s.stage == stage)
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrajectoryStats {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub mean_reward: f64,
    pub mean_steps: f64,
}

/// Records the current trajectory and keeps a bounded history of finished ones.
pub struct TrajectoryRecorder {
    max_trajectories: usize,
    history: VecDeque<Trajectory>,
    current: Option<Trajectory>,
}

impl TrajectoryRecorder {
    pub fn new(max_trajectories: usize) -> Self {
        Self {
            max_trajectories: max_trajectories.max(1),
            history: VecDeque::new(),
            current: None,
        }
    }

    /// Begin a new trajectory, discarding any unfinished one.
    pub fn start(&mut self, session_id: SessionId, query: impl Into<String>, iteration: usize) {
        self.current = Some(Trajectory::new(session_id, query.into(), iteration));
    }

    /// Append a step to the current trajectory. No-op when none is active.
    #[allow(clippy::too_many_arguments)]
    pub fn record_step(
        &mut self,
        stage: Stage,
        agent_id: &str,
        state: StateSnapshot,
        action: AgentAction,
        reward: f64,
        next_state: StateSnapshot,
        done: bool,
    ) -> Option<&Transition> {
        let current = self.current.as_mut()?;
        let mut step = Transition::new(stage, agent_id, action, reward)
            .with_state(state)
            .with_next_state(next_state);
        step.done = done;
        current.total_reward += reward;
        current.steps.push(step);
        current.steps.last()
    }

    pub fn record_decision(&mut self, output: &DecisionOutput) {
        if let Some(current) = self.current.as_mut() {
            current.decision = Some(output.clone());
        }
    }

    pub fn record_implementation(&mut self, output: &ImplementationOutput) {
        if let Some(current) = self.current.as_mut() {
            current.implementations.push(output.clone());
        }
    }

    pub fn record_validation(&mut self, output: &ValidationOutput) {
        if let Some(current) = self.current.as_mut() {
            current.validation = Some(output.clone());
        }
    }

    /// Close the current trajectory and move it into history.
    pub fn end(&mut self, success: bool) -> Option<&Trajectory> {
        let mut trajectory = self.current.take()?;
        trajectory.success = success;
        trajectory.completed_at = Some(Utc::now());
        self.history.push_back(trajectory);
        while self.history.len() > self.max_trajectories {
            self.history.pop_front();
        }
        self.history.back()
    }

    pub fn current(&self) -> Option<&Trajectory> {
        self.current.as_ref()
    }

    pub fn get(&self, trajectory_id: &str) -> Option<&Trajectory> {
        self.history.iter().find(|t| t.trajectory_id == trajectory_id)
    }

    /// The last `n` finished trajectories, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&Trajectory> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).collect()
    }

    pub fn successful(&self) -> Vec<&Trajectory> {
        self.history.iter().filter(|t| t.success).collect()
    }

    /// Every recorded step across the history, in order.
    pub fn all_transitions(&self) -> Vec<Transition> {
        self.history.iter().flat_map(|t| t.steps.iter().cloned()).collect()
    }

    pub fn stats(&self) -> TrajectoryStats {
        let total = self.history.len();
        if total == 0 {
            return TrajectoryStats::default();
        }
        let successful = self.history.iter().filter(|t| t.success).count();
        let n = total as f64;
        TrajectoryStats {
            total,
            successful,
            success_rate: successful as f64 / n,
            mean_reward: self.history.iter().map(|t| t.total_reward).sum::<f64>() / n,
            mean_steps: self.history.iter().map(|t| t.steps.len()).sum::<usize>() as f64 / n,
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.current = None;
    }
}

impl Default for TrajectoryRecorder {
    fn default() -> Self {
        Self::new(1000)
    }
}
