use std::io::Write;

use stratum_core::stage::{DecisionOutput, ImplementationOutput, Issue, Severity, TaskSpec, ValidationOutput};
use stratum_core::{AgentAction, Stage, Transition};
use stratum_learning::reward::{ComponentScorer, RewardComponent, ScoredOutput};
use tempfile::NamedTempFile;

/// Write `content` to a temporary `.toml` file that lives as long as the handle.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

/// `n` transitions for one agent with rewards 0, 1, 2, …
pub fn transitions(stage: Stage, agent_id: &str, n: usize) -> Vec<Transition> {
    (0..n)
        .map(|i| Transition::new(stage, agent_id, AgentAction::default_for(stage), i as f64))
        .collect()
}

pub fn decision_with_tasks(names: &[&str]) -> DecisionOutput {
    let mut output = DecisionOutput::new("strategist", "fixture query");
    output.tasks = names.iter().map(|n| TaskSpec::new(*n)).collect();
    output
}

pub fn implementation(agent_id: &str) -> ImplementationOutput {
    ImplementationOutput::new(agent_id, "task_fixture").with_metric("completion_rate", 1.0)
}

/// Validation carrying one issue per category.
pub fn validation_with_issues(reward: f64, categories: &[&str]) -> ValidationOutput {
    let mut output = ValidationOutput::new("inspector", reward);
    output.issues = categories
        .iter()
        .map(|c| Issue::new(*c, Severity::Medium))
        .collect();
    output
}

/// Scores every component with the same value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantScorer(pub f64);

impl ComponentScorer for ConstantScorer {
    fn score(&self, _component: RewardComponent, _output: ScoredOutput<'_>) -> f64 {
        self.0
    }
}
