use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use stratum_core::config::AppConfig;
use stratum_core::error::{Result, StratumError};
use stratum_core::{
    clamp_reward, state_key, AgentAction, DecisionOutput, ExecutionStatus, GlobalState, ImplementationOutput,
    ParentOutput, RunEvent, RunStatus, SessionId, Severity, Stage, StageContext, StageProcessor, StateSnapshot,
    Transition, ValidationOutput, ValueFunction,
};
use stratum_learning::experience::{BufferStats, TrajectoryStats};
use stratum_learning::reward::RewardStats;
use stratum_learning::{
    ComponentScorer, ExperienceStore, IterationReward, PolicyUpdater, RewardAggregator, TrajectoryRecorder,
    UpdateStats,
};
use tracing::{debug, error, info, warn};

use crate::bus::{QueueStats, TaskDispatcher};
use crate::feedback::{FeedbackRouter, FeedbackSummary};
use crate::graph::topology::DEFAULT_REWARD_TYPES;
use crate::graph::{GraphBuilder, GraphStatistics, TopologyGraph};
use crate::metrics::{PerformanceReport, PerformanceTracker};
use crate::runtime::RuntimeContext;

pub type DecisionProcessor = Arc<dyn StageProcessor<Output = DecisionOutput>>;
pub type ImplementationProcessor = Arc<dyn StageProcessor<Output = Vec<ImplementationOutput>>>;
pub type ValidationProcessor = Arc<dyn StageProcessor<Output = ValidationOutput>>;

/// Result of one `Orchestrator::run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub status: RunStatus,
    pub converged: bool,
    pub iterations: usize,
    pub final_reward: f64,
    pub reward_history: Vec<f64>,
    /// Task text handed to the last iteration, including folded-in suggestions.
    pub final_task: String,
    pub decision: Option<DecisionOutput>,
    pub implementations: Vec<ImplementationOutput>,
    pub validation: Option<ValidationOutput>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub runs: usize,
    pub experience: BufferStats,
    pub trajectories: TrajectoryStats,
    pub policy: UpdateStats,
    pub rewards: RewardStats,
    pub feedback: FeedbackSummary,
    pub graph: GraphStatistics,
    pub bus: QueueStats,
    pub metrics: PerformanceReport,
}

/// Outputs of the latest completed iteration.
#[derive(Default)]
struct LastOutputs {
    decision: Option<DecisionOutput>,
    implementations: Vec<ImplementationOutput>,
    validation: Option<ValidationOutput>,
    iterations: usize,
}

/// Drives the decision → implementation → validation pipeline until the
/// iteration reward reaches the threshold or the iteration budget runs out.
///
/// Graph, experience and policy state are owned here and only touched
/// between stage invocations.
pub struct Orchestrator {
    runtime: RuntimeContext,
    decision: DecisionProcessor,
    implementation: ImplementationProcessor,
    validation: ValidationProcessor,
    graph: TopologyGraph,
    experience: ExperienceStore,
    updater: PolicyUpdater,
    rewards: RewardAggregator,
    feedback: FeedbackRouter,
    dispatcher: TaskDispatcher,
    trajectories: TrajectoryRecorder,
    metrics: Arc<PerformanceTracker>,
    state: Option<GlobalState>,
    runs: usize,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        decision: DecisionProcessor,
        implementation: ImplementationProcessor,
        validation: ValidationProcessor,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = RuntimeContext::new(config);
        let cfg = runtime.config.clone();

        let graph = GraphBuilder::new()
            .with_policy_config(&cfg.policy)
            .hierarchical(&cfg.roster);
        let feedback = FeedbackRouter::new(&cfg.feedback)
            .with_dispatcher(TaskDispatcher::new(runtime.bus.clone(), "feedback_router"));
        let dispatcher = TaskDispatcher::new(runtime.bus.clone(), "orchestrator");

        Ok(Self {
            decision,
            implementation,
            validation,
            graph,
            experience: ExperienceStore::from_config(&cfg.experience),
            updater: PolicyUpdater::new(&cfg.policy),
            rewards: RewardAggregator::new(&cfg.reward),
            feedback,
            dispatcher,
            trajectories: TrajectoryRecorder::default(),
            metrics: Arc::new(PerformanceTracker::default()),
            state: None,
            runs: 0,
            runtime,
        })
    }

    /// Replace the component scorer used for stage rewards.
    pub fn with_scorer(mut self, scorer: Box<dyn ComponentScorer>) -> Self {
        self.rewards = RewardAggregator::with_scorer(&self.runtime.config.reward, scorer);
        self
    }

    /// Replace the roster topology.
    pub fn with_graph(mut self, graph: TopologyGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn config(&self) -> &AppConfig {
        &self.runtime.config
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn experience(&self) -> &ExperienceStore {
        &self.experience
    }

    pub fn trajectories(&self) -> &TrajectoryRecorder {
        &self.trajectories
    }

    pub fn feedback(&self) -> &FeedbackRouter {
        &self.feedback
    }

    /// Stage timings, rewards and outcomes gathered from run events.
    pub fn metrics(&self) -> &Arc<PerformanceTracker> {
        &self.metrics
    }

    /// State of the most recent run.
    pub fn state(&self) -> Option<&GlobalState> {
        self.state.as_ref()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            runs: self.runs,
            experience: self.experience.stats().clone(),
            trajectories: self.trajectories.stats(),
            policy: self.updater.stats(),
            rewards: self.rewards.stats(),
            feedback: self.feedback.summary(usize::MAX),
            graph: self.graph.statistics(),
            bus: self.runtime.bus.queue_stats(),
            metrics: self.metrics.report(),
        }
    }

    /// Run the pipeline on `task`.
    ///
    /// Returns the outcome for converged, exhausted and timed-out runs. A
    /// failing stage or cancellation ends the run with an error.
    pub async fn run(&mut self, task: &str) -> Result<RunOutcome> {
        let mut events = self.runtime.event_bus.subscribe();
        let result = self.execute(task).await;
        let observed = self.metrics.drain(&mut events);
        debug!(observed, "Run events folded into metrics");
        result
    }

    async fn execute(&mut self, task: &str) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut state = GlobalState::new(task);
        let mut last = LastOutputs::default();
        let session_id = state.session_id.clone();

        info!(session = %session_id, task, "Run started");
        self.runtime.event_bus.publish(RunEvent::RunStarted {
            session_id: session_id.clone(),
            task: task.to_string(),
        });

        let timeout_secs = self.runtime.config.orchestrator.timeout_secs;
        let cancel = self.runtime.cancel.clone();
        let result = {
            let run = self.run_loop(&mut state, &mut last, task);
            let bounded = async move {
                if timeout_secs == 0 {
                    return run.await;
                }
                match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
                    Ok(result) => result,
                    Err(_) => Ok(RunStatus::TimedOut),
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(StratumError::Cancelled),
                result = bounded => result,
            }
        };
        self.runs += 1;

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                if matches!(e, StratumError::Cancelled) {
                    warn!(session = %session_id, "Run cancelled");
                    self.trajectories.end(false);
                }
                state.status = RunStatus::Failed;
                self.finish(&state, last.iterations);
                self.state = Some(state);
                return Err(e);
            }
        };

        if status == RunStatus::TimedOut {
            warn!(session = %session_id, timeout_secs, "Run timed out");
            self.trajectories.end(false);
        }
        state.status = status;
        self.finish(&state, last.iterations);

        let outcome = RunOutcome {
            session_id,
            status,
            converged: status == RunStatus::Converged,
            iterations: last.iterations,
            final_reward: state.total_reward,
            reward_history: state.reward_history.clone(),
            final_task: state.current_task.clone(),
            decision: last.decision,
            implementations: last.implementations,
            validation: last.validation,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.state = Some(state);
        Ok(outcome)
    }

    fn finish(&self, state: &GlobalState, iterations: usize) {
        info!(
            session = %state.session_id,
            status = ?state.status,
            iterations,
            reward = state.total_reward,
            "Run finished"
        );
        self.runtime.event_bus.publish(RunEvent::RunFinished {
            session_id: state.session_id.clone(),
            status: state.status,
            iterations,
            final_reward: state.total_reward,
        });
    }

    async fn run_loop(&mut self, state: &mut GlobalState, last: &mut LastOutputs, task: &str) -> Result<RunStatus> {
        let max_iterations = self.runtime.config.orchestrator.max_iterations;
        let bus_running = self.runtime.bus.is_running();
        let decision_stage = self.decision.clone();
        let implementation_stage = self.implementation.clone();
        let validation_stage = self.validation.clone();

        for iteration in 0..max_iterations {
            state.iteration = iteration;
            info!(session = %state.session_id, iteration, "Iteration started");
            self.runtime.event_bus.publish(RunEvent::IterationStarted {
                session_id: state.session_id.clone(),
                iteration,
            });
            self.trajectories
                .start(state.session_id.clone(), state.current_task.clone(), iteration);

            let ctx = StageContext::new(state.session_id.clone(), iteration, state.current_task.clone())
                .with_feedback(last.validation.clone());

            let decision = match self.invoke(decision_stage.as_ref(), ctx.clone()).await {
                Ok(output) => output,
                Err(e) => return Err(self.stage_failed(state, Stage::Decision, e)),
            };
            if bus_running {
                self.dispatcher.dispatch_tasks(&decision);
            }

            let impl_ctx = ctx.clone().with_parent(ParentOutput::Decision(decision.clone()));
            let implementations = match self.invoke(implementation_stage.as_ref(), impl_ctx).await {
                Ok(output) => output,
                Err(e) => return Err(self.stage_failed(state, Stage::Implementation, e)),
            };
            if bus_running {
                self.dispatcher.report_results(&decision.strategy_id, &implementations);
            }

            let val_ctx = ctx.with_parent(ParentOutput::DecisionAndImplementation {
                decision: decision.clone(),
                implementations: implementations.clone(),
            });
            let validation = match self.invoke(validation_stage.as_ref(), val_ctx).await {
                Ok(output) => output,
                Err(e) => return Err(self.stage_failed(state, Stage::Validation, e)),
            };

            let converged = self.commit_iteration(state, &decision, &implementations, &validation);
            let suggestions = self.feedback.task_suggestions(&validation);

            last.decision = Some(decision);
            last.implementations = implementations;
            last.validation = Some(validation);
            last.iterations = iteration + 1;

            if converged {
                return Ok(RunStatus::Converged);
            }
            if !suggestions.is_empty() {
                debug!(count = suggestions.len(), "Folding suggestions into task");
                state.current_task = format!("{}\n\nAddress: {}", task, suggestions.join("; "));
            }
        }

        Ok(RunStatus::Exhausted)
    }

    async fn invoke<P>(&self, processor: &P, ctx: StageContext) -> Result<P::Output>
    where
        P: StageProcessor + ?Sized,
    {
        let stage = processor.stage();
        let iteration = ctx.iteration;
        let started = Instant::now();

        if self.runtime.config.orchestrator.enable_streaming {
            let mut chunks = processor.process_stream(ctx.clone());
            while let Some(text) = chunks.next().await {
                self.runtime.event_bus.publish(RunEvent::StageChunk { stage, text });
            }
        }

        debug!(%stage, processor = processor.name(), iteration, "Invoking stage");
        let output = processor.process(ctx).await.map_err(|e| match e {
            StratumError::StageFailed { .. } => e,
            other => StratumError::stage(stage, other),
        })?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(%stage, iteration, elapsed_ms, "Stage completed");
        self.runtime.event_bus.publish(RunEvent::StageCompleted {
            stage,
            iteration,
            elapsed_ms,
        });
        Ok(output)
    }

    fn stage_failed(&mut self, state: &mut GlobalState, stage: Stage, err: StratumError) -> StratumError {
        error!(session = %state.session_id, %stage, iteration = state.iteration, error = %err, "Stage failed");
        self.trajectories.end(false);
        state.status = RunStatus::Failed;
        self.runtime.event_bus.publish(RunEvent::RunFailed {
            session_id: state.session_id.clone(),
            stage,
            error: err.to_string(),
        });
        err
    }

    /// Score a completed iteration and fold it into the learning state.
    /// Returns whether the run converged.
    fn commit_iteration(
        &mut self,
        state: &mut GlobalState,
        decision: &DecisionOutput,
        implementations: &[ImplementationOutput],
        validation: &ValidationOutput,
    ) -> bool {
        let iteration = state.iteration;
        self.trajectories.record_decision(decision);
        for output in implementations {
            self.trajectories.record_implementation(output);
        }
        self.trajectories.record_validation(validation);

        let reward = self.rewards.compute(decision, implementations, validation);
        state.record_reward(reward.total);
        info!(iteration, reward = reward.total, weighted = reward.weighted, "Iteration scored");
        self.runtime.event_bus.publish(RunEvent::RewardComputed {
            iteration,
            reward: reward.total,
            stage_rewards: Stage::ALL.iter().map(|s| (*s, reward.stage_total(*s))).collect(),
        });

        let transitions = self.record_steps(iteration, decision, implementations, validation, &reward);
        self.refresh_values(reward.total);
        if self.runtime.config.orchestrator.enable_learning {
            self.learn(transitions);
        }

        let record = self.feedback.process(validation, iteration);
        if self.runtime.bus.is_running() {
            self.feedback.send_feedback_to_stages(&record);
            self.feedback.send_reward_signal(&state.session_id, reward.total);
            if validation.escalation_required {
                self.escalate(validation);
            }
        }

        let converged = reward.total >= self.runtime.config.orchestrator.reward_threshold;
        self.trajectories.end(converged);
        if converged {
            info!(iteration, reward = reward.total, "Converged");
            self.runtime.event_bus.publish(RunEvent::Converged {
                iteration,
                reward: reward.total,
            });
        }
        converged
    }

    /// One transition per contributing agent, sharing the iteration reward
    /// by stage weight.
    fn record_steps(
        &mut self,
        iteration: usize,
        decision: &DecisionOutput,
        implementations: &[ImplementationOutput],
        validation: &ValidationOutput,
        reward: &IterationReward,
    ) -> Vec<Transition> {
        let weights = self.runtime.config.reward.stage_weights;
        let total = reward.total;
        let per_impl = total * weights.implementation / implementations.len().max(1) as f64;

        let mut steps: Vec<(Stage, &str, AgentAction, f64)> =
            vec![(Stage::Decision, &decision.agent_id, AgentAction::Propose, total * weights.decision)];
        for output in implementations {
            let action = match output.status {
                ExecutionStatus::Failed | ExecutionStatus::Blocked => AgentAction::Coordinate,
                _ => AgentAction::Implement,
            };
            steps.push((Stage::Implementation, &output.agent_id, action, per_impl));
        }
        let action = if validation.escalation_required {
            AgentAction::Escalate
        } else {
            AgentAction::Validate
        };
        steps.push((Stage::Validation, &validation.agent_id, action, total * weights.validation));

        steps
            .into_iter()
            .filter_map(|(stage, agent, action, r)| {
                let next_stage = if stage == Stage::Validation {
                    (iteration + 1, Stage::Decision)
                } else {
                    (iteration, Stage::from_number(stage.number() + 1).unwrap_or(stage))
                };
                self.trajectories
                    .record_step(
                        stage,
                        agent,
                        step_state(iteration, stage, agent),
                        action,
                        r,
                        step_state(next_stage.0, next_stage.1, agent),
                        stage == Stage::Validation,
                    )
                    .cloned()
            })
            .collect()
    }

    /// Back-propagate the iteration reward from every validation agent and
    /// move node value estimates toward the (clamped) mean.
    fn refresh_values(&mut self, reward: f64) {
        let sources: Vec<String> = self
            .graph
            .stage_nodes(Stage::Validation)
            .iter()
            .map(|n| n.id.clone())
            .collect();
        if sources.is_empty() {
            return;
        }

        let discount = self.runtime.config.orchestrator.graph_discount;
        let blend = self.runtime.config.orchestrator.value_blend;
        let mut targets: HashMap<String, f64> = HashMap::new();
        for source in &sources {
            for (id, r) in self.graph.propagate_reward(reward, source, discount, &DEFAULT_REWARD_TYPES) {
                *targets.entry(id).or_insert(0.0) += r;
            }
        }
        let n = sources.len() as f64;
        for (id, sum) in targets {
            if let Some(node) = self.graph.node_mut(&id) {
                node.blend_value(clamp_reward(sum / n), blend);
            }
        }
    }

    fn learn(&mut self, transitions: Vec<Transition>) {
        self.experience.add_batch(transitions);
        let batch_size = self.runtime.config.orchestrator.batch_size;
        if self.experience.len() < batch_size {
            debug!(stored = self.experience.len(), batch_size, "Not enough experience to learn");
            return;
        }

        let batch = self.experience.sample(batch_size);
        let values: HashMap<String, f64> = batch
            .transitions
            .iter()
            .map(|t| {
                let value = self.graph.node(&t.agent_id).map_or(0.0, |n| n.value);
                (state_key(&t.state), value)
            })
            .collect();
        let values_fn: &dyn ValueFunction = &values;

        let results = self.updater.update(&batch.transitions, &mut self.graph, Some(values_fn));
        if let Some(indices) = &batch.indices {
            let priorities: Vec<f64> = self
                .updater
                .advantages(&batch.transitions, Some(values_fn))
                .into_iter()
                .map(f64::abs)
                .collect();
            self.experience.update_priorities(indices, &priorities);
        }
        if results.is_empty() {
            return;
        }

        let decay = self.runtime.config.policy.exploration_decay;
        let min_rate = self.runtime.config.policy.min_exploration;
        let agents: Vec<String> = results.iter().map(|r| r.agent_id.clone()).collect();
        for agent in &agents {
            self.updater.decay_exploration(&mut self.graph, agent, decay, min_rate);
        }
        let mean_loss = results.iter().map(|r| r.loss).sum::<f64>() / results.len() as f64;
        info!(agents = agents.len(), mean_loss, "Policies updated");
        self.runtime
            .event_bus
            .publish(RunEvent::PolicyUpdated { agents, mean_loss });
    }

    fn escalate(&self, validation: &ValidationOutput) {
        let worst = validation.issues.iter().max_by_key(|i| i.severity);
        let category = worst.map_or("validation", |i| i.category.as_str());
        let severity = worst.map_or(Severity::High, |i| i.severity);
        self.dispatcher
            .escalate(Stage::Validation, category, severity, &validation.overall_assessment);
    }
}

fn step_state(iteration: usize, stage: Stage, agent: &str) -> StateSnapshot {
    let mut state = StateSnapshot::new();
    state.insert("iteration".into(), iteration.into());
    state.insert("stage".into(), stage.number().into());
    state.insert("agent".into(), agent.into());
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_test_utils::{
        failing_stage, scripted_pipeline, ScriptedDecision, ScriptedImplementation, ScriptedValidation,
    };

    fn config(threshold: f64, max_iterations: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.orchestrator.reward_threshold = threshold;
        config.orchestrator.max_iterations = max_iterations;
        config.reward.weighted_share = 0.0;
        config
    }

    #[tokio::test]
    async fn converges_on_third_iteration() {
        let (d, i, v) = scripted_pipeline(&[0.3, 0.5, 0.65]);
        let mut orch = Orchestrator::new(config(0.6, 5), d, i, v).unwrap();
        let outcome = orch.run("find slow queries").await.unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.status, RunStatus::Converged);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.reward_history, vec![0.3, 0.5, 0.65]);
        assert_eq!(orch.trajectories().stats().total, 3);
        assert_eq!(orch.trajectories().stats().successful, 1);
    }

    #[tokio::test]
    async fn exhausts_without_convergence() {
        let (d, i, v) = scripted_pipeline(&[0.1, 0.2]);
        let mut orch = Orchestrator::new(config(0.9, 2), d, i, v).unwrap();
        let outcome = orch.run("task").await.unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.status, RunStatus::Exhausted);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.validation.is_some());
        assert_eq!(orch.state().unwrap().status, RunStatus::Exhausted);
    }

    #[tokio::test]
    async fn rewards_are_clamped() {
        let (d, i, v) = scripted_pipeline(&[3.0]);
        let mut orch = Orchestrator::new(config(0.6, 1), d, i, v).unwrap();
        let outcome = orch.run("task").await.unwrap();
        assert_eq!(outcome.final_reward, 1.0);
    }

    #[tokio::test]
    async fn stage_failure_commits_nothing() {
        let (d, _, v) = scripted_pipeline(&[0.5]);
        let mut orch = Orchestrator::new(config(0.6, 3), d, failing_stage(Stage::Implementation), v).unwrap();
        let mut events = orch.runtime().event_bus.subscribe();

        let err = orch.run("task").await.unwrap_err();
        assert!(matches!(err, StratumError::StageFailed { stage: Stage::Implementation, .. }));
        assert_eq!(orch.state().unwrap().status, RunStatus::Failed);
        assert!(orch.state().unwrap().reward_history.is_empty());
        assert!(orch.experience().is_empty());
        assert_eq!(orch.trajectories().stats().total, 1);
        assert_eq!(orch.trajectories().stats().successful, 0);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let RunEvent::RunFailed { stage, .. } = event {
                assert_eq!(stage, Stage::Implementation);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn run_events_feed_metrics() {
        let (d, i, v) = scripted_pipeline(&[0.3, 0.5, 0.65]);
        let mut orch = Orchestrator::new(config(0.6, 5), d, i, v).unwrap();
        orch.run("first").await.unwrap();

        let metrics = orch.metrics();
        assert_eq!(metrics.reward_trend(10), vec![0.3, 0.5, 0.65]);
        assert_eq!(metrics.success_rate(100), 1.0);
        let timings = metrics.summary(crate::metrics::EXECUTION_TIME).unwrap();
        assert_eq!(timings.count, 9);

        let (d, i, v) = scripted_pipeline(&[0.1]);
        let mut orch2 = Orchestrator::new(config(0.9, 1), d, i, v).unwrap();
        orch2.run("second").await.unwrap();
        assert_eq!(orch2.metrics().success_rate(100), 0.0);
        assert_eq!(orch2.stats().metrics.reward_trend, vec![0.1]);
    }

    #[tokio::test]
    async fn failed_run_is_recorded_in_metrics() {
        let (d, _, v) = scripted_pipeline(&[0.5]);
        let mut orch = Orchestrator::new(config(0.6, 3), d, failing_stage(Stage::Implementation), v).unwrap();
        assert!(orch.run("task").await.is_err());
        assert_eq!(orch.metrics().success_rate(100), 0.0);
        assert_eq!(
            orch.metrics().summary(crate::metrics::STAGE_FAILURE).map(|s| s.count),
            Some(1)
        );
        assert_eq!(orch.metrics().summary(crate::metrics::EXECUTION_TIME).map(|s| s.count), Some(1));
    }

    #[tokio::test]
    async fn suggestions_fold_into_next_task() {
        let decision = Arc::new(ScriptedDecision::new());
        let validation = ScriptedValidation::new(&[0.1, 0.2]).with_suggestion("add an index", 8);
        let mut orch = Orchestrator::new(
            config(0.9, 2),
            decision.clone(),
            Arc::new(ScriptedImplementation::new()),
            Arc::new(validation),
        )
        .unwrap();
        let outcome = orch.run("speed up report").await.unwrap();
        assert!(outcome.final_task.starts_with("speed up report"));
        assert!(outcome.final_task.contains("add an index"));
        let tasks = decision.seen_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0], "speed up report");
        assert!(tasks[1].contains("add an index"));
    }

    #[tokio::test]
    async fn learning_updates_policies_and_values() {
        let mut cfg = config(0.99, 4);
        cfg.orchestrator.batch_size = 4;
        cfg.policy.batch_size = 1;
        cfg.experience.seed = Some(11);
        let (d, i, v) = scripted_pipeline(&[0.4, 0.5, 0.6, 0.7]);
        let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();
        let mut events = orch.runtime().event_bus.subscribe();
        orch.run("task").await.unwrap();

        assert!(orch.experience().len() >= 4);
        assert!(orch.graph().nodes().any(|n| n.value > 0.0));
        let mut updated = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RunEvent::PolicyUpdated { .. }) {
                updated = true;
            }
        }
        assert!(updated);
        assert!(orch.stats().policy.total_updates > 0);
    }

    #[tokio::test]
    async fn learning_disabled_stores_nothing() {
        let mut cfg = config(0.99, 2);
        cfg.orchestrator.enable_learning = false;
        let (d, i, v) = scripted_pipeline(&[0.4, 0.5]);
        let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();
        orch.run("task").await.unwrap();
        assert!(orch.experience().is_empty());
    }

    #[tokio::test]
    async fn prioritized_store_is_refreshed() {
        let mut cfg = config(0.99, 3);
        cfg.experience.prioritized = true;
        cfg.experience.seed = Some(5);
        cfg.orchestrator.batch_size = 3;
        let (d, i, v) = scripted_pipeline(&[0.2, 0.9, 0.1]);
        let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();
        orch.run("task").await.unwrap();
        assert!(orch.experience().is_prioritized());
        assert!(orch.stats().experience.total_sampled > 0);
    }

    #[tokio::test]
    async fn times_out() {
        let mut cfg = config(0.99, 3);
        cfg.orchestrator.timeout_secs = 1;
        let (d, i, _) = scripted_pipeline(&[0.1]);
        let slow = Arc::new(ScriptedValidation::new(&[0.1]).with_delay(Duration::from_secs(5)));
        let mut orch = Orchestrator::new(cfg, d, i, slow).unwrap();
        let outcome = orch.run("task").await.unwrap();
        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(!outcome.converged);
        assert!(orch.state().unwrap().reward_history.is_empty());
    }

    #[tokio::test]
    async fn cancellation_fails_the_run() {
        let (d, i, _) = scripted_pipeline(&[0.1]);
        let slow = Arc::new(ScriptedValidation::new(&[0.1]).with_delay(Duration::from_secs(5)));
        let mut orch = Orchestrator::new(config(0.99, 3), d, i, slow).unwrap();
        let runtime = orch.runtime().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runtime.shutdown();
        });
        let err = orch.run("task").await.unwrap_err();
        assert!(matches!(err, StratumError::Cancelled));
        assert_eq!(orch.state().unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn streaming_publishes_chunks() {
        let mut cfg = config(0.5, 1);
        cfg.orchestrator.enable_streaming = true;
        let (d, i, v) = scripted_pipeline(&[0.7]);
        let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();
        let mut events = orch.runtime().event_bus.subscribe();
        orch.run("task").await.unwrap();

        let mut chunks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RunEvent::StageChunk { stage, text } = event {
                chunks.push((stage, text));
            }
        }
        assert!(chunks.iter().any(|(s, _)| *s == Stage::Decision));
    }

    #[tokio::test]
    async fn feedback_goes_over_running_bus() {
        let cfg = config(0.99, 1);
        let (d, i, _) = scripted_pipeline(&[0.2]);
        let v = Arc::new(ScriptedValidation::new(&[0.2]).escalating("implementation"));
        let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();
        orch.runtime().bus.start().unwrap();
        orch.run("task").await.unwrap();

        let stats = orch.stats().bus;
        // tasks, results, one feedback message, reward signal, escalation
        assert!(stats.history_len >= 5);
        let escalations = orch.runtime().bus.history(&crate::bus::HistoryFilter {
            message_type: Some(stratum_core::MessageType::Escalation),
            ..Default::default()
        });
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].target_stage, Stage::Implementation);
        orch.runtime().bus.stop().await.unwrap();
    }
}
