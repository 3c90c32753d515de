use serde::{Deserialize, Serialize};

/// Kind of relationship an edge expresses.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Work handed downstream.
    TaskFlow,
    /// Evaluation flowing upstream.
    Feedback,
    /// Peers inside one stage.
    Coordination,
    /// Credit assignment path.
    Reward,
}

impl EdgeType {
    pub const ALL: [EdgeType; 4] = [
        EdgeType::TaskFlow,
        EdgeType::Feedback,
        EdgeType::Coordination,
        EdgeType::Reward,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::TaskFlow => "task_flow",
            EdgeType::Feedback => "feedback",
            EdgeType::Coordination => "coordination",
            EdgeType::Reward => "reward",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed, weighted edge between two agent nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    pub edge_type: EdgeType,
    /// Non-negative and finite.
    pub weight: f64,
    /// Inactive edges are ignored by propagation and the adjacency matrix.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Edge {
    /// Create an active edge with weight 1.0.
    pub fn new(source: impl Into<String>, target: impl Into<String>, edge_type: EdgeType) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            edge_type,
            weight: 1.0,
            active: true,
        }
    }

    pub fn task_flow(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeType::TaskFlow)
    }

    pub fn feedback(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeType::Feedback)
    }

    pub fn coordination(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeType::Coordination)
    }

    pub fn reward(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, EdgeType::Reward)
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Mark the edge inactive.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn has_valid_weight(&self) -> bool {
        self.weight.is_finite() && self.weight >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::feedback("inspector", "strategist").with_weight(0.5);
        assert_eq!(e.id, "inspector->strategist");
        assert_eq!(e.edge_type, EdgeType::Feedback);
        assert_eq!(e.weight, 0.5);
        assert!(e.active);
        assert!(!Edge::reward("a", "b").inactive().active);
    }

    #[test]
    fn test_weight_validation() {
        assert!(Edge::task_flow("a", "b").with_weight(0.0).has_valid_weight());
        assert!(!Edge::task_flow("a", "b").with_weight(-0.1).has_valid_weight());
        assert!(!Edge::task_flow("a", "b").with_weight(f64::NAN).has_valid_weight());
        assert!(!Edge::task_flow("a", "b").with_weight(f64::INFINITY).has_valid_weight());
    }

    #[test]
    fn test_edge_type_serde() {
        let json = serde_json::to_string(&EdgeType::TaskFlow).unwrap();
        assert_eq!(json, "\"task_flow\"");
    }
}
