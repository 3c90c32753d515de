use stratum_core::config::{PolicyConfig, RosterConfig};
use stratum_core::Stage;
use tracing::info;

use super::edge::Edge;
use super::node::AgentNode;
use super::topology::TopologyGraph;

/// Weight of feedback edges from validation back to implementation agents.
const IMPLEMENTATION_FEEDBACK_WEIGHT: f64 = 0.5;

/// Builds the standard three-stage topology from a roster.
///
/// Wiring:
/// - decision agents coordinate with each other in a full mesh
/// - every implementation group coordinates internally in a full mesh
/// - validation agents coordinate with each other in a full mesh
/// - task flow runs decision → implementation → validation (weight 1.0)
/// - feedback runs validation → decision (1.0) and validation → implementation (0.5)
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    learning_rate: Option<f64>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed node policies from the updater settings.
    pub fn with_policy_config(mut self, config: &PolicyConfig) -> Self {
        self.learning_rate = Some(config.learning_rate);
        self
    }

    pub fn hierarchical(&self, roster: &RosterConfig) -> TopologyGraph {
        let mut graph = TopologyGraph::new();

        for stage in Stage::ALL {
            for id in roster.agents(stage) {
                let mut node = AgentNode::new(id.clone(), stage, id);
                if let Some(lr) = self.learning_rate {
                    node.policy = node.policy.with_learning_rate(lr);
                }
                graph.add_node(node);
            }
        }

        let decision = roster.agents(Stage::Decision);
        let implementation = roster.agents(Stage::Implementation);
        let validation = roster.agents(Stage::Validation);

        mesh(&mut graph, &decision);
        for group in &roster.implementation_groups {
            mesh(&mut graph, group);
        }
        mesh(&mut graph, &validation);

        for d in &decision {
            for i in &implementation {
                graph.add_edge(Edge::task_flow(d, i));
            }
        }
        for i in &implementation {
            for v in &validation {
                graph.add_edge(Edge::task_flow(i, v));
            }
        }
        for v in &validation {
            for d in &decision {
                graph.add_edge(Edge::feedback(v, d));
            }
            for i in &implementation {
                graph.add_edge(Edge::feedback(v, i).with_weight(IMPLEMENTATION_FEEDBACK_WEIGHT));
            }
        }

        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Hierarchical topology built"
        );
        graph
    }
}

fn mesh(graph: &mut TopologyGraph, members: &[String]) {
    for a in members {
        for b in members {
            if a != b {
                graph.add_edge(Edge::coordination(a, b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeType;

    #[test]
    fn test_default_roster_wiring() {
        let roster = RosterConfig::default();
        let g = GraphBuilder::new().hierarchical(&roster);
        // 2 decision + 3 implementation + 1 validation
        assert_eq!(g.node_count(), 6);

        let stats = g.statistics();
        // decision mesh 2, group mesh 2 + 0, validation mesh 0
        assert_eq!(stats.edges_per_type[&EdgeType::Coordination], 4);
        // 2×3 decision→impl plus 3×1 impl→validation
        assert_eq!(stats.edges_per_type[&EdgeType::TaskFlow], 9);
        // 1×2 to decision plus 1×3 to implementation
        assert_eq!(stats.edges_per_type[&EdgeType::Feedback], 5);
        assert!(stats.has_cycles);

        assert!(g.edge("architect", "tester").is_none());
        assert_eq!(g.edge("inspector", "tester").unwrap().weight, 0.5);
        assert_eq!(g.edge("inspector", "critic").unwrap().weight, 1.0);
    }

    #[test]
    fn test_reward_reaches_every_upstream_agent() {
        let g = GraphBuilder::new().hierarchical(&RosterConfig::default());
        let rewards = g.propagate_reward(1.0, "inspector", 0.9, &crate::graph::topology::DEFAULT_REWARD_TYPES);
        assert_eq!(rewards.len(), 6);
        assert!((rewards["tester"] - 0.9).abs() < 1e-12);
        // both decision agents hear from all three implementation agents
        assert!((rewards["strategist"] - 3.0 * 0.9 * 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_policy_config_seeds_learning_rate() {
        let config = PolicyConfig {
            learning_rate: 0.05,
            ..Default::default()
        };
        let g = GraphBuilder::new()
            .with_policy_config(&config)
            .hierarchical(&RosterConfig::default());
        assert!(g.nodes().all(|n| n.policy.learning_rate == 0.05));
    }
}
