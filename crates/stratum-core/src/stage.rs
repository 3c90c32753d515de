use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{short_id, SessionId, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    #[serde(default = "objective_id")]
    pub objective_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub measurable_criteria: Vec<String>,
}

fn objective_id() -> String {
    short_id("obj")
}

impl Objective {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            objective_id: objective_id(),
            name: name.into(),
            description: String::new(),
            priority: 0,
            measurable_criteria: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Hard,
    #[default]
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ConstraintKind,
}

/// A unit of work handed from the decision stage to implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default = "task_id")]
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub assigned_roles: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_effort")]
    pub estimated_effort: f64,
}

fn task_id() -> String {
    short_id("task")
}

fn default_effort() -> f64 {
    1.0
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task_id: task_id(),
            name: name.into(),
            description: String::new(),
            priority: 0,
            assigned_roles: Vec::new(),
            dependencies: Vec::new(),
            estimated_effort: default_effort(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Strategy produced by the decision stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub strategy_id: String,
    /// Agent credited with the output.
    pub agent_id: String,
    pub query: String,
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub discussion_summary: String,
    pub created_at: DateTime<Utc>,
}

impl DecisionOutput {
    pub fn new(agent_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            strategy_id: short_id("strategy"),
            agent_id: agent_id.into(),
            query: query.into(),
            objectives: Vec::new(),
            tasks: Vec::new(),
            constraints: Vec::new(),
            success_criteria: Vec::new(),
            discussion_summary: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default = "artifact_id")]
    pub artifact_id: String,
    pub name: String,
    #[serde(default)]
    pub artifact_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub created_by: String,
}

fn artifact_id() -> String {
    short_id("art")
}

impl Artifact {
    pub fn new(name: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id(),
            name: name.into(),
            artifact_type: artifact_type.into(),
            content: serde_json::Value::Null,
            created_by: String::new(),
        }
    }
}

/// Result of carrying out one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationOutput {
    pub implementation_id: String,
    pub agent_id: String,
    pub task_id: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub status: ExecutionStatus,
    /// Free-form numeric metrics, e.g. `completion_rate`, `execution_time`.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImplementationOutput {
    pub fn new(agent_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            implementation_id: short_id("impl"),
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            artifacts: Vec::new(),
            status: ExecutionStatus::Pending,
            metrics: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Message priority used when an issue of this severity is escalated.
    pub fn priority(self) -> i32 {
        match self {
            Severity::Low => 3,
            Severity::Medium => 5,
            Severity::High => 7,
            Severity::Critical => 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default = "issue_id")]
    pub issue_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
}

fn issue_id() -> String {
    short_id("issue")
}

impl Issue {
    pub fn new(category: impl Into<String>, severity: Severity) -> Self {
        Self {
            issue_id: issue_id(),
            title: String::new(),
            description: String::new(),
            severity,
            category: category.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(default = "suggestion_id")]
    pub suggestion_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_stage: Option<Stage>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub related_issues: Vec<String>,
}

fn suggestion_id() -> String {
    short_id("sug")
}

impl Suggestion {
    pub fn new(title: impl Into<String>, priority: i32) -> Self {
        Self {
            suggestion_id: suggestion_id(),
            title: title.into(),
            description: String::new(),
            target_stage: None,
            priority,
            related_issues: Vec::new(),
        }
    }
}

/// Evaluation of a decision and its implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub validation_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub target_strategy_id: String,
    #[serde(default)]
    pub target_implementation_ids: Vec<String>,
    /// Per-dimension scores in [0, 1].
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    /// Reward signal in [-1, 1].
    #[serde(default)]
    pub reward_signal: f64,
    #[serde(default)]
    pub escalation_required: bool,
    #[serde(default)]
    pub overall_assessment: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationOutput {
    pub fn new(agent_id: impl Into<String>, reward_signal: f64) -> Self {
        Self {
            validation_id: short_id("val"),
            agent_id: agent_id.into(),
            target_strategy_id: String::new(),
            target_implementation_ids: Vec::new(),
            scores: BTreeMap::new(),
            issues: Vec::new(),
            suggestions: Vec::new(),
            reward_signal,
            escalation_required: false,
            overall_assessment: String::new(),
            validated_at: Utc::now(),
        }
    }

    /// Suggestions at or above `threshold`, highest priority first, at most `limit`.
    pub fn top_suggestions(&self, threshold: i32, limit: usize) -> Vec<&Suggestion> {
        let mut picked: Vec<&Suggestion> = self
            .suggestions
            .iter()
            .filter(|s| s.priority >= threshold)
            .collect();
        picked.sort_by(|a, b| b.priority.cmp(&a.priority));
        picked.truncate(limit);
        picked
    }
}

/// Output of the upstream stage(s) handed to the next stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParentOutput {
    Decision(DecisionOutput),
    DecisionAndImplementation {
        decision: DecisionOutput,
        implementations: Vec<ImplementationOutput>,
    },
}

/// Input handed to a stage processor. Stages never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub session_id: SessionId,
    pub iteration: usize,
    pub task: String,
    #[serde(default)]
    pub parent: Option<ParentOutput>,
    /// Previous iteration's validation, if any.
    #[serde(default)]
    pub feedback: Option<ValidationOutput>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl StageContext {
    pub fn new(session_id: SessionId, iteration: usize, task: impl Into<String>) -> Self {
        Self {
            session_id,
            iteration,
            task: task.into(),
            parent: None,
            feedback: None,
            constraints: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: ParentOutput) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_feedback(mut self, feedback: Option<ValidationOutput>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn decision(&self) -> Option<&DecisionOutput> {
        match &self.parent {
            Some(ParentOutput::Decision(d)) => Some(d),
            Some(ParentOutput::DecisionAndImplementation { decision, .. }) => Some(decision),
            None => None,
        }
    }

    pub fn implementations(&self) -> &[ImplementationOutput] {
        match &self.parent {
            Some(ParentOutput::DecisionAndImplementation { implementations, .. }) => implementations,
            _ => &[],
        }
    }
}
