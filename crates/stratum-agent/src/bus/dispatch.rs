use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use stratum_core::message::{Message, MessageType};
use stratum_core::stage::{DecisionOutput, ImplementationOutput, Severity, ValidationOutput};
use stratum_core::Stage;
use tracing::{debug, info};

use super::CommunicationBus;

/// Typed helpers that turn stage outputs into bus messages.
#[derive(Clone)]
pub struct TaskDispatcher {
    bus: Arc<CommunicationBus>,
    sender: String,
}

impl TaskDispatcher {
    pub fn new(bus: Arc<CommunicationBus>, sender: impl Into<String>) -> Self {
        Self {
            bus,
            sender: sender.into(),
        }
    }

    pub fn bus(&self) -> &Arc<CommunicationBus> {
        &self.bus
    }

    /// One task-dispatch message per task of the strategy. Returns how many
    /// were accepted.
    pub fn dispatch_tasks(&self, decision: &DecisionOutput) -> usize {
        let mut sent = 0;
        for task in &decision.tasks {
            let message = Message::new(&self.sender, Stage::Decision, Stage::Implementation, MessageType::TaskDispatch)
                .with_priority(task.priority)
                .in_conversation(decision.strategy_id.clone())
                .with_field("task", json!(task))
                .with_field("strategy_id", decision.strategy_id.clone())
                .with_field("dispatch_time", Utc::now().to_rfc3339());
            if self.bus.send(message) {
                sent += 1;
            }
        }
        info!(strategy = %decision.strategy_id, sent, total = decision.tasks.len(), "Tasks dispatched");
        sent
    }

    /// Report implementation results to validation as a single message.
    pub fn report_results(&self, strategy_id: &str, outputs: &[ImplementationOutput]) -> bool {
        if outputs.is_empty() {
            debug!(strategy = strategy_id, "No results to report");
            return false;
        }
        let message = Message::new(&self.sender, Stage::Implementation, Stage::Validation, MessageType::ResultReport)
            .in_conversation(strategy_id)
            .with_field("results", json!(outputs))
            .with_field("report_time", Utc::now().to_rfc3339());
        self.bus.send(message)
    }

    /// Feedback from validation to one upstream stage.
    pub fn send_feedback(
        &self,
        target: Stage,
        feedback_id: &str,
        validation: &ValidationOutput,
        target_stages: &[Stage],
    ) -> bool {
        let message = Message::new(&self.sender, Stage::Validation, target, MessageType::Feedback)
            .with_priority(if validation.escalation_required { 8 } else { 5 })
            .in_conversation(validation.target_strategy_id.clone())
            .with_field("feedback_id", feedback_id)
            .with_field("reward_signal", validation.reward_signal)
            .with_field("issues", json!(validation.issues))
            .with_field("suggestions", json!(validation.suggestions))
            .with_field("target_stages", json!(target_stages))
            .with_field("overall_assessment", validation.overall_assessment.clone());
        self.bus.send(message)
    }

    /// Raise a problem to the stage above `from`, prioritized by severity.
    pub fn escalate(&self, from: Stage, category: &str, severity: Severity, description: &str) -> bool {
        let target = from.upstream();
        let message = Message::new(&self.sender, from, target, MessageType::Escalation)
            .with_priority(severity.priority())
            .with_field("category", category)
            .with_field("severity", json!(severity))
            .with_field("description", description);
        info!(%from, %target, category, ?severity, "Escalating");
        self.bus.send(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HistoryFilter;
    use stratum_core::config::BusConfig;
    use stratum_core::stage::{Issue, TaskSpec};

    fn dispatcher() -> TaskDispatcher {
        TaskDispatcher::new(Arc::new(CommunicationBus::new(&BusConfig::default())), "orchestrator")
    }

    #[test]
    fn dispatches_one_message_per_task() {
        let d = dispatcher();
        let mut decision = DecisionOutput::new("strategist", "build it");
        decision.tasks = vec![TaskSpec::new("schema").with_priority(3), TaskSpec::new("queries")];
        assert_eq!(d.dispatch_tasks(&decision), 2);

        let sent = d.bus().history(&HistoryFilter {
            message_type: Some(MessageType::TaskDispatch),
            ..Default::default()
        });
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].priority, 3);
        assert_eq!(sent[0].payload["task"]["name"], "schema");
        assert_eq!(sent[1].conversation_id.as_deref(), Some(decision.strategy_id.as_str()));
    }

    #[test]
    fn empty_results_not_reported() {
        let d = dispatcher();
        assert!(!d.report_results("s1", &[]));
        assert!(d.report_results("s1", &[ImplementationOutput::new("developer", "t1")]));
        let sent = d.bus().history(&HistoryFilter::default());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_stage, Stage::Validation);
    }

    #[test]
    fn feedback_carries_contract_fields() {
        let d = dispatcher();
        let mut validation = ValidationOutput::new("inspector", 0.4);
        validation.issues.push(Issue::new("implementation", Severity::High));
        assert!(d.send_feedback(Stage::Implementation, "fb_1", &validation, &[Stage::Implementation]));
        let sent = &d.bus().history(&HistoryFilter::default())[0];
        assert_eq!(sent.payload["feedback_id"], "fb_1");
        assert_eq!(sent.payload["target_stages"], json!([2]));
        assert_eq!(sent.payload["issues"][0]["severity"], "high");
    }

    #[test]
    fn escalation_goes_upstream_with_severity_priority() {
        let d = dispatcher();
        assert!(d.escalate(Stage::Validation, "data_quality", Severity::Critical, "nulls in key"));
        let sent = &d.bus().history(&HistoryFilter::default())[0];
        assert_eq!(sent.target_stage, Stage::Implementation);
        assert_eq!(sent.priority, 9);
        assert_eq!(sent.payload["severity"], "critical");

        assert!(!d.escalate(Stage::Decision, "", Severity::Low, ""));
    }
}
