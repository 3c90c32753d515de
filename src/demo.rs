//! Deterministic heuristic stages used by `stratum run`.
//!
//! Each work item is one clause of the task. Implementation capacity grows
//! by one item per iteration and validation rewards the completed share.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use stratum_agent::{DecisionProcessor, ImplementationProcessor, ValidationProcessor};
use stratum_core::config::RosterConfig;
use stratum_core::{
    Artifact, DecisionOutput, ExecutionStatus, ImplementationOutput, Issue, Result, Severity, Stage, StageContext,
    StageProcessor, StratumError, Suggestion, TaskSpec, ValidationOutput,
};

/// Tasks the implementation stage can finish in its first iteration. Each
/// later iteration finishes one more.
const INITIAL_CAPACITY: usize = 2;

/// Split a task into work items on commas, semicolons, newlines and "and".
fn clauses(task: &str) -> Vec<String> {
    let items: Vec<String> = task
        .split([',', ';', '\n'])
        .flat_map(|part| part.split(" and "))
        .map(|part| part.trim().trim_start_matches("Address:").trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        vec![task.trim().to_string()]
    } else {
        items
    }
}

fn first_or(agents: &[String], fallback: &str) -> String {
    agents.first().cloned().unwrap_or_else(|| fallback.to_string())
}

pub struct HeuristicDecision {
    agent: String,
}

impl StageProcessor for HeuristicDecision {
    type Output = DecisionOutput;

    fn stage(&self) -> Stage {
        Stage::Decision
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<DecisionOutput>> {
        Box::pin(async move {
            let mut output = DecisionOutput::new(self.agent.clone(), ctx.task.clone());
            let items = clauses(&ctx.task);
            let count = items.len() as i32;
            output.tasks = items
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    let mut spec = TaskSpec::new(name).with_priority(count - i as i32);
                    spec.estimated_effort = 1.0 + spec.name.split_whitespace().count() as f64 * 0.25;
                    spec
                })
                .collect();
            output.success_criteria = vec!["every work item completed".into()];
            if let Some(feedback) = &ctx.feedback {
                output.discussion_summary = format!("revising after reward {:.2}", feedback.reward_signal);
            }
            Ok(output)
        })
    }

    fn process_stream(&self, ctx: StageContext) -> BoxStream<'_, String> {
        let chunks: Vec<String> = clauses(&ctx.task).into_iter().map(|c| format!("- {}\n", c)).collect();
        stream::iter(chunks).boxed()
    }
}

pub struct HeuristicImplementation {
    agents: Vec<String>,
}

impl StageProcessor for HeuristicImplementation {
    type Output = Vec<ImplementationOutput>;

    fn stage(&self) -> Stage {
        Stage::Implementation
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<Vec<ImplementationOutput>>> {
        Box::pin(async move {
            let decision = ctx
                .decision()
                .ok_or_else(|| StratumError::stage(Stage::Implementation, "missing decision output"))?;
            let capacity = INITIAL_CAPACITY + ctx.iteration;
            Ok(decision
                .tasks
                .iter()
                .enumerate()
                .map(|(i, task)| {
                    let agent = &self.agents[i % self.agents.len()];
                    let status = if i < capacity {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Blocked
                    };
                    let mut output = ImplementationOutput::new(agent.clone(), task.task_id.clone())
                        .with_status(status)
                        .with_metric("execution_time", task.estimated_effort);
                    if status == ExecutionStatus::Completed {
                        let mut artifact = Artifact::new(task.name.clone(), "note");
                        artifact.created_by = agent.clone();
                        output.artifacts.push(artifact);
                    }
                    output
                })
                .collect())
        })
    }
}

pub struct HeuristicValidation {
    agent: String,
}

impl StageProcessor for HeuristicValidation {
    type Output = ValidationOutput;

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<ValidationOutput>> {
        Box::pin(async move {
            let implementations = ctx.implementations();
            let planned = ctx.decision().map(|d| d.tasks.len()).unwrap_or(0).max(1);
            let completed = implementations
                .iter()
                .filter(|i| i.status == ExecutionStatus::Completed)
                .count();
            let coverage = completed as f64 / planned as f64;

            let mut output = ValidationOutput::new(self.agent.clone(), coverage);
            if let Some(decision) = ctx.decision() {
                output.target_strategy_id = decision.strategy_id.clone();
            }
            output.target_implementation_ids = implementations.iter().map(|i| i.implementation_id.clone()).collect();
            output.scores.insert("coverage".into(), coverage);

            let blocked = planned.saturating_sub(completed);
            if blocked > 0 {
                let severity = if coverage < 0.5 { Severity::High } else { Severity::Medium };
                output
                    .issues
                    .push(Issue::new("implementation", severity).with_title(format!("{} work items blocked", blocked)));
                output
                    .suggestions
                    .push(Suggestion::new("finish the blocked work items", 7));
                output.overall_assessment = "incomplete".into();
            } else {
                output.overall_assessment = "complete".into();
            }
            Ok(output)
        })
    }
}

/// Demo stages staffed from the first agent of each roster role.
pub fn pipeline(roster: &RosterConfig) -> (DecisionProcessor, ImplementationProcessor, ValidationProcessor) {
    let mut implementers = roster.agents(Stage::Implementation);
    if implementers.is_empty() {
        implementers.push("developer".into());
    }
    (
        Arc::new(HeuristicDecision {
            agent: first_or(&roster.agents(Stage::Decision), "strategist"),
        }),
        Arc::new(HeuristicImplementation { agents: implementers }),
        Arc::new(HeuristicValidation {
            agent: first_or(&roster.agents(Stage::Validation), "inspector"),
        }),
    )
}
