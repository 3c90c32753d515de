use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{short_id, Stage};

/// Opaque message payload.
pub type Payload = serde_json::Map<String, Value>;

/// Kind of an inter-stage message. Serialized as a snake_case tag.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskDispatch,
    ResultReport,
    Feedback,
    Escalation,
    Coordination,
    RewardSignal,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::TaskDispatch,
        MessageType::ResultReport,
        MessageType::Feedback,
        MessageType::Escalation,
        MessageType::Coordination,
        MessageType::RewardSignal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::TaskDispatch => "task_dispatch",
            MessageType::ResultReport => "result_report",
            MessageType::Feedback => "feedback",
            MessageType::Escalation => "escalation",
            MessageType::Coordination => "coordination",
            MessageType::RewardSignal => "reward_signal",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message exchanged between stages on the communication bus.
///
/// The field names, type tags and stage numbers are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender: String,
    /// Empty means broadcast to every subscriber of the target stage.
    #[serde(default)]
    pub receiver: String,
    pub source_stage: Stage,
    pub target_stage: Stage,
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub requires_response: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        source_stage: Stage,
        target_stage: Stage,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: short_id("msg"),
            sender: sender.into(),
            receiver: String::new(),
            source_stage,
            target_stage,
            message_type,
            priority: 0,
            payload: Payload::new(),
            conversation_id: None,
            parent_message_id: None,
            round: None,
            requires_response: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = receiver.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn requiring_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Build a reply addressed back to the sender of `parent`.
    ///
    /// The reply joins the parent's conversation (or starts one named after
    /// the parent) and advances the round.
    pub fn reply_to(parent: &Message, sender: impl Into<String>, message_type: MessageType) -> Self {
        let conversation = parent
            .conversation_id
            .clone()
            .unwrap_or_else(|| parent.message_id.clone());
        let mut reply = Message::new(sender, parent.target_stage, parent.source_stage, message_type)
            .with_receiver(parent.sender.clone())
            .in_conversation(conversation);
        reply.parent_message_id = Some(parent.message_id.clone());
        reply.round = Some(parent.round.map_or(1, |r| r + 1));
        reply
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Payload requirements for one message type.
#[derive(Debug, Clone)]
pub struct MessageContract {
    pub message_type: MessageType,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    pub response_timeout: Duration,
}

impl MessageContract {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            response_timeout: Duration::from_secs(300),
        }
    }

    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn optional(mut self, fields: &[&str]) -> Self {
        self.optional_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// List every problem with the message's payload. Empty means valid.
    ///
    /// A required field is violated when it is missing, null, or a blank string.
    pub fn validate(&self, message: &Message) -> Vec<String> {
        let mut violations = Vec::new();
        for field in &self.required_fields {
            match message.payload.get(field) {
                None => violations.push(format!("missing required field '{}'", field)),
                Some(Value::Null) => violations.push(format!("required field '{}' is null", field)),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    violations.push(format!("required field '{}' is blank", field))
                }
                Some(_) => {}
            }
        }
        violations
    }
}

/// Contracts keyed by message type. Types without a contract always validate.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<MessageType, MessageContract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contracts matching the payloads produced by the dispatcher and
    /// feedback router.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            MessageContract::new(MessageType::TaskDispatch)
                .require(&["task"])
                .optional(&["dispatch_time"]),
        );
        registry.register(
            MessageContract::new(MessageType::ResultReport)
                .require(&["results"])
                .optional(&["report_time"]),
        );
        registry.register(
            MessageContract::new(MessageType::Feedback)
                .require(&["feedback_id", "reward_signal"])
                .optional(&["issues", "suggestions", "target_stages", "overall_assessment"]),
        );
        registry.register(
            MessageContract::new(MessageType::Escalation)
                .require(&["category", "severity"])
                .optional(&["description"])
                .with_timeout(Duration::from_secs(180)),
        );
        registry.register(
            MessageContract::new(MessageType::RewardSignal)
                .require(&["reward", "session_id"])
                .optional(&["timestamp"]),
        );
        registry
    }

    /// Register or replace the contract for its message type.
    pub fn register(&mut self, contract: MessageContract) {
        self.contracts.insert(contract.message_type, contract);
    }

    pub fn get(&self, message_type: MessageType) -> Option<&MessageContract> {
        self.contracts.get(&message_type)
    }

    pub fn validate(&self, message: &Message) -> Vec<String> {
        self.contracts
            .get(&message.message_type)
            .map(|c| c.validate(message))
            .unwrap_or_default()
    }

    pub fn response_timeout(&self, message_type: MessageType) -> Option<Duration> {
        self.contracts.get(&message_type).map(|c| c.response_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_round_trip() {
        let parent = Message::new("planner", Stage::Decision, Stage::Implementation, MessageType::TaskDispatch)
            .with_field("task", json!({"title": "build"}))
            .with_priority(3);
        let reply = Message::reply_to(&parent, "builder", MessageType::ResultReport)
            .with_field("results", json!([]));

        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"message_type\":\"result_report\""));
        assert!(text.contains("\"source_stage\":2"));
        assert!(text.contains("\"target_stage\":1"));

        let parsed: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.message_id, reply.message_id);
        assert_eq!(parsed.parent_message_id.as_deref(), Some(parent.message_id.as_str()));
        assert_eq!(parsed.conversation_id.as_deref(), Some(parent.message_id.as_str()));
        assert_eq!(parsed.round, Some(1));
        assert_eq!(parsed.receiver, "planner");
    }

    #[test]
    fn test_minimal_wire_message_defaults() {
        let parsed: Message = serde_json::from_value(json!({
            "message_id": "m1",
            "sender": "a",
            "source_stage": 3,
            "target_stage": 1,
            "message_type": "reward_signal",
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(parsed.is_broadcast());
        assert!(!parsed.requires_response);
        assert_eq!(parsed.message_type, MessageType::RewardSignal);
    }

    #[test]
    fn test_contract_flags_missing_null_and_blank() {
        let contract = MessageContract::new(MessageType::Escalation).require(&["a", "b", "c", "d"]);
        let msg = Message::new("x", Stage::Validation, Stage::Implementation, MessageType::Escalation)
            .with_field("b", Value::Null)
            .with_field("c", "   ")
            .with_field("d", 0);
        let violations = contract.validate(&msg);
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("'a'"));
        assert!(violations[1].contains("null"));
        assert!(violations[2].contains("blank"));
    }

    #[test]
    fn test_registry_without_contract_accepts() {
        let registry = ContractRegistry::with_defaults();
        let msg = Message::new("x", Stage::Decision, Stage::Decision, MessageType::Coordination);
        assert!(registry.validate(&msg).is_empty());

        let bad = Message::new("x", Stage::Decision, Stage::Implementation, MessageType::TaskDispatch);
        assert_eq!(registry.validate(&bad).len(), 1);
        assert_eq!(
            registry.response_timeout(MessageType::Escalation),
            Some(Duration::from_secs(180))
        );
    }
}
