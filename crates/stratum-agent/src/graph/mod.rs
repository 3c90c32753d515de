//! Agent topology: a directed graph of agent nodes joined by typed edges.
//!
//! Nodes belong to a pipeline stage and own a `Policy` and a scalar value
//! estimate. Edges carry a type (task flow, feedback, coordination, reward),
//! a non-negative weight and an active flag.
//!
//! `TopologyGraph` supports structural edits, reward back-propagation over
//! predecessor links, payload forward-propagation over successor links,
//! cycle detection, path queries and degree centrality. It exports to Mermaid
//! and JSON. `GraphBuilder::hierarchical` wires the standard
//! three-stage layout from a roster.

pub mod builder;
pub mod edge;
pub mod node;
pub mod topology;

pub use builder::GraphBuilder;
pub use edge::{Edge, EdgeType};
pub use node::AgentNode;
pub use topology::{GraphPath, GraphSnapshot, GraphStatistics, TopologyGraph};
