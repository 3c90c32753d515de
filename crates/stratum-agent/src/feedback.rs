use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use stratum_core::config::FeedbackConfig;
use stratum_core::message::{Message, MessageType};
use stratum_core::stage::ValidationOutput;
use stratum_core::{short_id, SessionId, Stage};
use tracing::{debug, info};

use crate::bus::TaskDispatcher;

/// How many issue categories `summary` reports.
const TOP_CATEGORIES: usize = 5;

/// A validation result addressed to the stages it concerns.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub feedback_id: String,
    pub iteration: usize,
    pub target_stages: Vec<Stage>,
    pub validation: ValidationOutput,
    pub created_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn reward_signal(&self) -> f64 {
        self.validation.reward_signal
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackSummary {
    pub count: usize,
    pub mean_reward: f64,
    /// Most frequent issue categories with their counts, most frequent first.
    pub top_categories: Vec<(String, usize)>,
}

/// Turns validation output into feedback for upstream stages.
pub struct FeedbackRouter {
    config: FeedbackConfig,
    history: VecDeque<FeedbackRecord>,
    dispatcher: Option<TaskDispatcher>,
}

impl FeedbackRouter {
    pub fn new(config: &FeedbackConfig) -> Self {
        Self {
            config: config.clone(),
            history: VecDeque::new(),
            dispatcher: None,
        }
    }

    /// Emit feedback on the bus behind `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Stages an evaluation is about, judged from its issue categories.
    ///
    /// Each issue addresses one stage: a category mentioning "strategy" or
    /// "decision" goes to the decision stage, otherwise one mentioning
    /// "implementation" or "execution" goes to the implementation stage.
    /// Without any match both stages are addressed.
    pub fn target_stages(validation: &ValidationOutput) -> Vec<Stage> {
        let mut stages = BTreeSet::new();
        for issue in &validation.issues {
            let category = issue.category.to_lowercase();
            if category.contains("strategy") || category.contains("decision") {
                stages.insert(Stage::Decision);
            } else if category.contains("implementation") || category.contains("execution") {
                stages.insert(Stage::Implementation);
            }
        }
        if stages.is_empty() {
            return vec![Stage::Decision, Stage::Implementation];
        }
        stages.into_iter().collect()
    }

    /// Record a validation result and decide who it is for.
    pub fn process(&mut self, validation: &ValidationOutput, iteration: usize) -> FeedbackRecord {
        let record = FeedbackRecord {
            feedback_id: short_id("fb"),
            iteration,
            target_stages: Self::target_stages(validation),
            validation: validation.clone(),
            created_at: Utc::now(),
        };
        debug!(
            feedback_id = %record.feedback_id,
            targets = ?record.target_stages,
            issues = validation.issues.len(),
            "Feedback processed"
        );

        if self.config.max_history > 0 {
            while self.history.len() >= self.config.max_history {
                self.history.pop_front();
            }
            self.history.push_back(record.clone());
        }
        record
    }

    /// One feedback message per target stage. Returns how many were accepted.
    pub fn send_feedback_to_stages(&self, record: &FeedbackRecord) -> usize {
        let Some(dispatcher) = &self.dispatcher else {
            return 0;
        };
        let sent = record
            .target_stages
            .iter()
            .filter(|stage| {
                dispatcher.send_feedback(**stage, &record.feedback_id, &record.validation, &record.target_stages)
            })
            .count();
        info!(feedback_id = %record.feedback_id, sent, "Feedback sent");
        sent
    }

    /// Report the iteration reward to the decision stage.
    pub fn send_reward_signal(&self, session_id: &SessionId, reward: f64) -> bool {
        let Some(dispatcher) = &self.dispatcher else {
            return false;
        };
        let message = Message::new("feedback_router", Stage::Validation, Stage::Decision, MessageType::RewardSignal)
            .with_field("reward", reward)
            .with_field("session_id", session_id.to_string())
            .with_field("timestamp", json!(Utc::now().to_rfc3339()));
        dispatcher.bus().send(message)
    }

    /// Titles of the suggestions worth folding into the next task.
    pub fn task_suggestions(&self, validation: &ValidationOutput) -> Vec<String> {
        validation
            .top_suggestions(self.config.priority_threshold, self.config.max_suggestions)
            .into_iter()
            .map(|s| s.title.clone())
            .collect()
    }

    /// Statistics over the last `limit` records.
    pub fn summary(&self, limit: usize) -> FeedbackSummary {
        let skip = self.history.len().saturating_sub(limit);
        let recent: Vec<&FeedbackRecord> = self.history.iter().skip(skip).collect();
        if recent.is_empty() {
            return FeedbackSummary::default();
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in &recent {
            for issue in &record.validation.issues {
                *counts.entry(issue.category.as_str()).or_insert(0) += 1;
            }
        }
        let mut top_categories: Vec<(String, usize)> =
            counts.into_iter().map(|(c, n)| (c.to_string(), n)).collect();
        top_categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_categories.truncate(TOP_CATEGORIES);

        FeedbackSummary {
            count: recent.len(),
            mean_reward: recent.iter().map(|r| r.reward_signal()).sum::<f64>() / recent.len() as f64,
            top_categories,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &FeedbackRecord> {
        self.history.iter()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::{CommunicationBus, HistoryFilter};
    use stratum_core::config::BusConfig;
    use stratum_core::stage::{Issue, Severity, Suggestion};

    fn validation(categories: &[&str], reward: f64) -> ValidationOutput {
        let mut v = ValidationOutput::new("inspector", reward);
        v.issues = categories.iter().map(|c| Issue::new(*c, Severity::Medium)).collect();
        v
    }

    #[test]
    fn test_target_stage_routing() {
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&["Strategy gap"], 0.1)),
            vec![Stage::Decision]
        );
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&["execution_error", "implementation"], 0.1)),
            vec![Stage::Implementation]
        );
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&["implementation_decision"], 0.1)),
            vec![Stage::Decision]
        );
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&["execution_strategy", "execution"], 0.1)),
            vec![Stage::Decision, Stage::Implementation]
        );
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&["formatting"], 0.1)),
            vec![Stage::Decision, Stage::Implementation]
        );
        assert_eq!(
            FeedbackRouter::target_stages(&validation(&[], 0.1)),
            vec![Stage::Decision, Stage::Implementation]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let config = FeedbackConfig {
            max_history: 2,
            ..Default::default()
        };
        let mut router = FeedbackRouter::new(&config);
        for i in 0..4 {
            router.process(&validation(&[], 0.1), i);
        }
        let iterations: Vec<usize> = router.history().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![2, 3]);
    }

    #[test]
    fn test_summary_counts_categories() {
        let mut router = FeedbackRouter::new(&FeedbackConfig::default());
        router.process(&validation(&["a", "b", "c"], 0.2), 0);
        router.process(&validation(&["a", "d", "e", "f"], 0.4), 1);
        router.process(&validation(&["a", "b"], 0.6), 2);

        let summary = router.summary(10);
        assert_eq!(summary.count, 3);
        assert!((summary.mean_reward - 0.4).abs() < 1e-12);
        assert_eq!(summary.top_categories.len(), 5);
        assert_eq!(summary.top_categories[0], ("a".to_string(), 3));
        assert_eq!(summary.top_categories[1], ("b".to_string(), 2));

        let last = router.summary(1);
        assert_eq!(last.count, 1);
        assert!((last.mean_reward - 0.6).abs() < 1e-12);
        assert_eq!(FeedbackRouter::new(&FeedbackConfig::default()).summary(5).count, 0);
    }

    #[test]
    fn test_task_suggestions_respect_threshold_and_limit() {
        let router = FeedbackRouter::new(&FeedbackConfig::default());
        let mut v = validation(&[], 0.1);
        v.suggestions = vec![
            Suggestion::new("add index", 8),
            Suggestion::new("rename", 2),
            Suggestion::new("cache", 7),
            Suggestion::new("split", 9),
            Suggestion::new("retry", 7),
        ];
        assert_eq!(router.task_suggestions(&v), vec!["split", "add index", "cache"]);
    }

    #[test]
    fn test_messages_per_target_stage() {
        let bus = Arc::new(CommunicationBus::new(&BusConfig::default()));
        let mut router = FeedbackRouter::new(&FeedbackConfig::default())
            .with_dispatcher(TaskDispatcher::new(bus.clone(), "inspector"));
        let record = router.process(&validation(&["quality"], 0.3), 0);
        assert_eq!(router.send_feedback_to_stages(&record), 2);
        assert!(router.send_reward_signal(&SessionId::from_str("s1"), 0.3));

        let feedback = bus.history(&HistoryFilter {
            message_type: Some(MessageType::Feedback),
            ..Default::default()
        });
        let targets: Vec<Stage> = feedback.iter().map(|m| m.target_stage).collect();
        assert_eq!(targets, vec![Stage::Decision, Stage::Implementation]);

        let rewards = bus.history(&HistoryFilter {
            message_type: Some(MessageType::RewardSignal),
            ..Default::default()
        });
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].target_stage, Stage::Decision);
        assert_eq!(rewards[0].payload["session_id"], "s1");
    }

    #[test]
    fn test_without_bus_nothing_is_sent() {
        let mut router = FeedbackRouter::new(&FeedbackConfig::default());
        let record = router.process(&validation(&[], 0.3), 0);
        assert_eq!(router.send_feedback_to_stages(&record), 0);
        assert!(!router.send_reward_signal(&SessionId::new(), 0.3));
    }
}
