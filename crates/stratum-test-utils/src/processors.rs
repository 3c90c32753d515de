use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use stratum_core::error::{Result, StratumError};
use stratum_core::stage::{
    Artifact, DecisionOutput, ExecutionStatus, ImplementationOutput, Issue, Severity, StageContext, Suggestion,
    TaskSpec, ValidationOutput,
};
use stratum_core::{Stage, StageProcessor};

/// Decision stage that plans two tasks and remembers every task text it saw.
#[derive(Default)]
pub struct ScriptedDecision {
    seen: Mutex<Vec<String>>,
}

impl ScriptedDecision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_tasks(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl StageProcessor for ScriptedDecision {
    type Output = DecisionOutput;

    fn stage(&self) -> Stage {
        Stage::Decision
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<DecisionOutput>> {
        Box::pin(async move {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(ctx.task.clone());
            }
            let mut output = DecisionOutput::new("strategist", ctx.task.clone());
            output.tasks = vec![TaskSpec::new("plan").with_priority(2), TaskSpec::new("build")];
            output.success_criteria = vec!["report runs under a second".into()];
            Ok(output)
        })
    }

    fn process_stream(&self, ctx: StageContext) -> BoxStream<'_, String> {
        stream::iter(vec!["planning: ".to_string(), ctx.task]).boxed()
    }
}

/// Implementation stage producing one completed output per planned task,
/// alternating between two agents.
#[derive(Default)]
pub struct ScriptedImplementation;

impl ScriptedImplementation {
    pub fn new() -> Self {
        Self
    }
}

impl StageProcessor for ScriptedImplementation {
    type Output = Vec<ImplementationOutput>;

    fn stage(&self) -> Stage {
        Stage::Implementation
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<Vec<ImplementationOutput>>> {
        Box::pin(async move {
            let decision = ctx
                .decision()
                .ok_or_else(|| StratumError::stage(Stage::Implementation, "no decision to implement"))?;
            let agents = ["architect", "developer"];
            Ok(decision
                .tasks
                .iter()
                .enumerate()
                .map(|(i, task)| {
                    let mut output = ImplementationOutput::new(agents[i % agents.len()], task.task_id.clone())
                        .with_status(ExecutionStatus::Completed)
                        .with_metric("execution_time", 1.5);
                    output.artifacts.push(Artifact::new(format!("{}.sql", task.name), "code"));
                    output
                })
                .collect())
        })
    }
}

/// Validation stage replaying a fixed reward per iteration. Iterations past
/// the script repeat its last value.
pub struct ScriptedValidation {
    rewards: Vec<f64>,
    suggestions: Vec<(String, i32)>,
    escalation: Option<String>,
    delay: Option<Duration>,
}

impl ScriptedValidation {
    pub fn new(rewards: &[f64]) -> Self {
        Self {
            rewards: rewards.to_vec(),
            suggestions: Vec::new(),
            escalation: None,
            delay: None,
        }
    }

    pub fn with_suggestion(mut self, title: &str, priority: i32) -> Self {
        self.suggestions.push((title.to_string(), priority));
        self
    }

    /// Raise a high-severity issue of `category` and require escalation.
    pub fn escalating(mut self, category: &str) -> Self {
        self.escalation = Some(category.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn reward_for(&self, iteration: usize) -> f64 {
        self.rewards
            .get(iteration)
            .or_else(|| self.rewards.last())
            .copied()
            .unwrap_or(0.0)
    }
}

impl StageProcessor for ScriptedValidation {
    type Output = ValidationOutput;

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<ValidationOutput>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut output = ValidationOutput::new("inspector", self.reward_for(ctx.iteration));
            if let Some(decision) = ctx.decision() {
                output.target_strategy_id = decision.strategy_id.clone();
            }
            output.target_implementation_ids = ctx
                .implementations()
                .iter()
                .map(|i| i.implementation_id.clone())
                .collect();
            output.scores.insert("correctness".into(), output.reward_signal.clamp(0.0, 1.0));
            output.suggestions = self
                .suggestions
                .iter()
                .map(|(title, priority)| Suggestion::new(title.clone(), *priority))
                .collect();
            if let Some(category) = &self.escalation {
                output
                    .issues
                    .push(Issue::new(category.clone(), Severity::High).with_title("needs rework"));
                output.escalation_required = true;
                output.overall_assessment = "escalated".into();
            }
            Ok(output)
        })
    }
}

/// A stage that always fails.
pub struct FailingStage<O> {
    stage: Stage,
    _output: PhantomData<fn() -> O>,
}

impl<O> FailingStage<O> {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            _output: PhantomData,
        }
    }
}

impl<O: Send + 'static> StageProcessor for FailingStage<O> {
    type Output = O;

    fn stage(&self) -> Stage {
        self.stage
    }

    fn process(&self, _ctx: StageContext) -> BoxFuture<'_, Result<O>> {
        let stage = self.stage;
        Box::pin(async move { Err(StratumError::stage(stage, "scripted failure")) })
    }
}

pub fn failing_stage<O: Send + 'static>(stage: Stage) -> Arc<dyn StageProcessor<Output = O>> {
    Arc::new(FailingStage::<O>::new(stage))
}

/// Scripted decision, implementation and validation stages; validation
/// replays `rewards`.
#[allow(clippy::type_complexity)]
pub fn scripted_pipeline(
    rewards: &[f64],
) -> (
    Arc<dyn StageProcessor<Output = DecisionOutput>>,
    Arc<dyn StageProcessor<Output = Vec<ImplementationOutput>>>,
    Arc<dyn StageProcessor<Output = ValidationOutput>>,
) {
    (
        Arc::new(ScriptedDecision::new()),
        Arc::new(ScriptedImplementation::new()),
        Arc::new(ScriptedValidation::new(rewards)),
    )
}
