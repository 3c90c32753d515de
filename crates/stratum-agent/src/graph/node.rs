use serde::{Deserialize, Serialize};
use stratum_core::{Policy, Stage};

/// An agent in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Pipeline stage the agent works in.
    pub stage: Stage,
    /// Role tag, e.g. "strategist" or "tester".
    pub agent_type: String,
    pub policy: Policy,
    /// Scalar value estimate refreshed from propagated rewards.
    #[serde(default)]
    pub value: f64,
    /// Ids of edges ending at this node.
    #[serde(default)]
    pub incoming: Vec<String>,
    /// Ids of edges starting at this node.
    #[serde(default)]
    pub outgoing: Vec<String>,
}

impl AgentNode {
    /// Create a node with a fresh policy for its type and stage.
    pub fn new(id: impl Into<String>, stage: Stage, agent_type: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        Self {
            id: id.into(),
            stage,
            policy: Policy::new(agent_type.clone(), stage),
            agent_type,
            value: 0.0,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Replace the policy.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the initial value estimate.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Move the value estimate toward `target` by `blend`.
    pub fn blend_value(&mut self, target: f64, blend: f64) {
        self.value = (1.0 - blend) * self.value + blend * target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = AgentNode::new("critic", Stage::Decision, "critic").with_value(0.4);
        assert_eq!(node.policy.agent_type, "critic");
        assert_eq!(node.policy.stage, Stage::Decision);
        assert_eq!(node.value, 0.4);
        assert!(node.incoming.is_empty() && node.outgoing.is_empty());
    }

    #[test]
    fn test_blend_value() {
        let mut node = AgentNode::new("a", Stage::Validation, "inspector").with_value(1.0);
        node.blend_value(0.0, 0.1);
        assert!((node.value - 0.9).abs() < 1e-12);
    }
}
