use serde::Serialize;
use stratum_core::{DecisionOutput, ExecutionStatus, ImplementationOutput, Stage, ValidationOutput};

/// Named contribution to a stage's reward.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardComponent {
    DecisionQuality,
    DecisionFeasibility,
    DecisionInnovation,
    ImplementationCompletion,
    ImplementationQuality,
    ImplementationEfficiency,
    ValidationAccuracy,
    ValidationCoverage,
    ValidationFeedbackQuality,
}

impl RewardComponent {
    pub const ALL: [RewardComponent; 9] = [
        RewardComponent::DecisionQuality,
        RewardComponent::DecisionFeasibility,
        RewardComponent::DecisionInnovation,
        RewardComponent::ImplementationCompletion,
        RewardComponent::ImplementationQuality,
        RewardComponent::ImplementationEfficiency,
        RewardComponent::ValidationAccuracy,
        RewardComponent::ValidationCoverage,
        RewardComponent::ValidationFeedbackQuality,
    ];

    pub fn stage(self) -> Stage {
        match self {
            RewardComponent::DecisionQuality
            | RewardComponent::DecisionFeasibility
            | RewardComponent::DecisionInnovation => Stage::Decision,
            RewardComponent::ImplementationCompletion
            | RewardComponent::ImplementationQuality
            | RewardComponent::ImplementationEfficiency => Stage::Implementation,
            RewardComponent::ValidationAccuracy
            | RewardComponent::ValidationCoverage
            | RewardComponent::ValidationFeedbackQuality => Stage::Validation,
        }
    }

    pub fn for_stage(stage: Stage) -> impl Iterator<Item = RewardComponent> {
        Self::ALL.into_iter().filter(move |c| c.stage() == stage)
    }

    pub fn name(self) -> &'static str {
        match self {
            RewardComponent::DecisionQuality => "decision_quality",
            RewardComponent::DecisionFeasibility => "decision_feasibility",
            RewardComponent::DecisionInnovation => "decision_innovation",
            RewardComponent::ImplementationCompletion => "implementation_completion",
            RewardComponent::ImplementationQuality => "implementation_quality",
            RewardComponent::ImplementationEfficiency => "implementation_efficiency",
            RewardComponent::ValidationAccuracy => "validation_accuracy",
            RewardComponent::ValidationCoverage => "validation_coverage",
            RewardComponent::ValidationFeedbackQuality => "validation_feedback_quality",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Weight within its stage. Each stage's defaults sum to 1.
    pub fn default_weight(self) -> f64 {
        match self {
            RewardComponent::DecisionQuality => 0.4,
            RewardComponent::DecisionFeasibility => 0.4,
            RewardComponent::DecisionInnovation => 0.2,
            RewardComponent::ImplementationCompletion => 0.3,
            RewardComponent::ImplementationQuality => 0.4,
            RewardComponent::ImplementationEfficiency => 0.3,
            RewardComponent::ValidationAccuracy => 0.4,
            RewardComponent::ValidationCoverage => 0.3,
            RewardComponent::ValidationFeedbackQuality => 0.3,
        }
    }
}

impl std::fmt::Display for RewardComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A borrowed stage output handed to a scorer.
#[derive(Debug, Clone, Copy)]
pub enum ScoredOutput<'a> {
    Decision(&'a DecisionOutput),
    Implementation(&'a ImplementationOutput),
    Validation(&'a ValidationOutput),
}

/// Scores one reward component of one stage output, in [0, 1].
///
/// Called only with outputs of the component's own stage.
pub trait ComponentScorer: Send + Sync {
    fn score(&self, component: RewardComponent, output: ScoredOutput<'_>) -> f64;
}

/// Fixed structural checks on stage outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHeuristics;

impl ComponentScorer for DefaultHeuristics {
    fn score(&self, component: RewardComponent, output: ScoredOutput<'_>) -> f64 {
        use RewardComponent::*;
        let score = match (component, output) {
            (DecisionQuality, ScoredOutput::Decision(d)) => decision_quality(d),
            (DecisionFeasibility, ScoredOutput::Decision(d)) => decision_feasibility(d),
            (DecisionInnovation, ScoredOutput::Decision(_)) => 0.6,
            (ImplementationCompletion, ScoredOutput::Implementation(i)) => {
                i.metric("completion_rate").unwrap_or(0.5)
            }
            (ImplementationQuality, ScoredOutput::Implementation(i)) => implementation_quality(i),
            (ImplementationEfficiency, ScoredOutput::Implementation(i)) => implementation_efficiency(i),
            (ValidationAccuracy, ScoredOutput::Validation(v)) => validation_accuracy(v),
            (ValidationCoverage, ScoredOutput::Validation(v)) => validation_coverage(v),
            (ValidationFeedbackQuality, ScoredOutput::Validation(v)) => validation_feedback(v),
            _ => 0.0,
        };
        score.clamp(0.0, 1.0)
    }
}

fn decision_quality(d: &DecisionOutput) -> f64 {
    let mut score = 0.5;
    if d.objectives.len() >= 2 {
        score += 0.2;
    }
    if d.success_criteria.len() >= 2 {
        score += 0.15;
    }
    if d.discussion_summary.chars().count() > 50 {
        score += 0.15;
    }
    score
}

fn decision_feasibility(d: &DecisionOutput) -> f64 {
    let mut score = 0.5;
    if d.tasks.len() >= 2 {
        score += 0.25;
    }
    if !d.constraints.is_empty() {
        score += 0.15;
    }
    if d.tasks.iter().any(|t| t.priority > 0) {
        score += 0.1;
    }
    score
}

fn implementation_quality(i: &ImplementationOutput) -> f64 {
    let mut score = 0.5;
    if !i.artifacts.is_empty() {
        score += 0.3;
    }
    if i.status == ExecutionStatus::Completed {
        score += 0.2;
    }
    score
}

fn implementation_efficiency(i: &ImplementationOutput) -> f64 {
    match i.metric("execution_time").unwrap_or(10.0) {
        t if t <= 1.0 => 1.0,
        t if t <= 5.0 => 0.8,
        t if t <= 10.0 => 0.6,
        _ => 0.4,
    }
}

fn validation_accuracy(v: &ValidationOutput) -> f64 {
    let mut score = 0.5;
    if v.scores.len() >= 3 {
        score += 0.2;
    }
    let mut severities: Vec<_> = v.issues.iter().map(|i| i.severity).collect();
    severities.sort();
    severities.dedup();
    if severities.len() >= 2 {
        score += 0.15;
    }
    if !v.scores.is_empty() {
        let avg = v.scores.values().sum::<f64>() / v.scores.len() as f64;
        if (0.3..=0.9).contains(&avg) {
            score += 0.15;
        }
    }
    score
}

fn validation_coverage(v: &ValidationOutput) -> f64 {
    let mut score = 0.5;
    if v.scores.len() >= 4 {
        score += 0.3;
    } else if v.scores.len() >= 2 {
        score += 0.15;
    }
    if v.suggestions.len() >= 2 {
        score += 0.2;
    }
    score
}

fn validation_feedback(v: &ValidationOutput) -> f64 {
    let mut score = 0.5;
    if !v.suggestions.is_empty() {
        if v.suggestions.iter().any(|s| !s.related_issues.is_empty()) {
            score += 0.25;
        }
        if v.suggestions.iter().any(|s| s.priority > 0) {
            score += 0.15;
        }
    }
    if v.overall_assessment.chars().count() > 20 {
        score += 0.1;
    }
    score
}
