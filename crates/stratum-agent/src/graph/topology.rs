use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stratum_core::{Policy, PolicyStore, Stage};
use tracing::{debug, error, warn};

use super::edge::{Edge, EdgeType};
use super::node::AgentNode;

/// Edge types reward propagation follows unless told otherwise.
pub const DEFAULT_REWARD_TYPES: [EdgeType; 3] = [EdgeType::Reward, EdgeType::TaskFlow, EdgeType::Feedback];

/// Edge types forward propagation follows unless told otherwise.
pub const DEFAULT_FORWARD_TYPES: [EdgeType; 2] = [EdgeType::TaskFlow, EdgeType::Coordination];

/// Serializable form of a topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<AgentNode>,
    pub edges: Vec<Edge>,
}

/// A route through the graph with its accumulated cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphPath {
    pub nodes: Vec<String>,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_per_stage: BTreeMap<Stage, usize>,
    pub edges_per_type: BTreeMap<EdgeType, usize>,
    pub average_out_degree: f64,
    pub has_cycles: bool,
}

/// Directed graph of agent nodes and typed edges.
///
/// Node iteration follows insertion order. Every edge's endpoints exist,
/// and each (source, target) pair has at most one edge.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: HashMap<String, AgentNode>,
    order: Vec<String>,
    edges: HashMap<String, Edge>,
    edge_index: HashMap<(String, String), String>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Refused when the id is already taken.
    pub fn add_node(&mut self, mut node: AgentNode) -> bool {
        if self.nodes.contains_key(&node.id) {
            warn!(node = %node.id, "Node already exists");
            return false;
        }
        node.incoming.clear();
        node.outgoing.clear();
        let id = node.id.clone();
        self.successors.insert(id.clone(), Vec::new());
        self.predecessors.insert(id.clone(), Vec::new());
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        true
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        let touching: Vec<(String, String)> = node
            .incoming
            .iter()
            .chain(node.outgoing.iter())
            .filter_map(|eid| self.edges.get(eid))
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        for (source, target) in touching {
            self.remove_edge(&source, &target);
        }
        self.nodes.remove(id);
        self.successors.remove(id);
        self.predecessors.remove(id);
        self.order.retain(|n| n != id);
        debug!(node = id, "Node removed");
        true
    }

    /// Add an edge between two existing nodes.
    ///
    /// Refused without mutation when an endpoint is missing, the pair is
    /// already connected, the id is taken, or the weight is negative or
    /// not finite.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            error!(source = %edge.source, target = %edge.target, "Edge endpoint does not exist");
            return false;
        }
        let key = (edge.source.clone(), edge.target.clone());
        if self.edge_index.contains_key(&key) || self.edges.contains_key(&edge.id) {
            error!(edge = %edge.id, "Edge already exists");
            return false;
        }
        if !edge.has_valid_weight() {
            error!(edge = %edge.id, weight = edge.weight, "Edge weight must be finite and non-negative");
            return false;
        }

        if let Some(n) = self.nodes.get_mut(&edge.source) {
            n.outgoing.push(edge.id.clone());
        }
        if let Some(n) = self.nodes.get_mut(&edge.target) {
            n.incoming.push(edge.id.clone());
        }
        if let Some(s) = self.successors.get_mut(&edge.source) {
            s.push(edge.target.clone());
        }
        if let Some(p) = self.predecessors.get_mut(&edge.target) {
            p.push(edge.source.clone());
        }
        self.edge_index.insert(key, edge.id.clone());
        self.edges.insert(edge.id.clone(), edge);
        true
    }

    pub fn remove_edge(&mut self, source: &str, target: &str) -> bool {
        let key = (source.to_string(), target.to_string());
        let Some(edge_id) = self.edge_index.remove(&key) else {
            return false;
        };
        self.edges.remove(&edge_id);
        if let Some(n) = self.nodes.get_mut(source) {
            n.outgoing.retain(|e| e != &edge_id);
        }
        if let Some(n) = self.nodes.get_mut(target) {
            n.incoming.retain(|e| e != &edge_id);
        }
        if let Some(s) = self.successors.get_mut(source) {
            s.retain(|t| t != target);
        }
        if let Some(p) = self.predecessors.get_mut(target) {
            p.retain(|s| s != source);
        }
        true
    }

    pub fn node(&self, id: &str) -> Option<&AgentNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut AgentNode> {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, source: &str, target: &str) -> Option<&Edge> {
        self.edge_index
            .get(&(source.to_string(), target.to_string()))
            .and_then(|id| self.edges.get(id))
    }

    /// Successor ids, in edge insertion order.
    pub fn neighbors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &AgentNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Edges grouped by source node, in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes()
            .flat_map(|n| n.outgoing.iter())
            .filter_map(|eid| self.edges.get(eid))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn stage_nodes(&self, stage: Stage) -> Vec<&AgentNode> {
        self.nodes().filter(|n| n.stage == stage).collect()
    }

    /// Copy of the nodes of one stage and the edges among them.
    pub fn subgraph(&self, stage: Stage) -> TopologyGraph {
        let mut sub = TopologyGraph::new();
        for node in self.stage_nodes(stage) {
            sub.add_node(node.clone());
        }
        for edge in self.edges() {
            if sub.nodes.contains_key(&edge.source) && sub.nodes.contains_key(&edge.target) {
                sub.add_edge(edge.clone());
            }
        }
        sub
    }

    /// Rewrite weights of existing edges. Unknown pairs and invalid
    /// weights are skipped. Returns how many edges changed.
    pub fn update_edge_weights(&mut self, updates: &HashMap<(String, String), f64>) -> usize {
        let mut changed = 0;
        for (key, &weight) in updates {
            if !(weight.is_finite() && weight >= 0.0) {
                warn!(source = %key.0, target = %key.1, weight, "Ignoring invalid edge weight");
                continue;
            }
            if let Some(edge) = self.edge_index.get(key).and_then(|id| self.edges.get_mut(id)) {
                edge.weight = weight;
                changed += 1;
            }
        }
        changed
    }

    pub fn set_edge_active(&mut self, source: &str, target: &str, active: bool) -> bool {
        let key = (source.to_string(), target.to_string());
        match self.edge_index.get(&key).and_then(|id| self.edges.get_mut(id)) {
            Some(edge) => {
                edge.active = active;
                true
            }
            None => false,
        }
    }

    /// Dense weight matrix in node insertion order; 0 where there is no
    /// edge or the edge is inactive.
    pub fn adjacency_matrix(&self) -> (Vec<Vec<f64>>, Vec<String>) {
        let ordering = self.order.clone();
        let position: HashMap<&str, usize> = ordering
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let n = ordering.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for edge in self.edges.values().filter(|e| e.active) {
            if let (Some(&i), Some(&j)) = (
                position.get(edge.source.as_str()),
                position.get(edge.target.as_str()),
            ) {
                matrix[i][j] = edge.weight;
            }
        }
        (matrix, ordering)
    }

    /// Spread `reward` from `source` backwards over predecessor links.
    ///
    /// Only active edges of `allowed` types are followed. A predecessor
    /// receives `value × discount × weight` where `value` is what the node
    /// being expanded holds at that moment; contributions from several
    /// paths sum while the predecessor has not been expanded yet. Each node
    /// is expanded once and the source keeps exactly `reward`.
    pub fn propagate_reward(
        &self,
        reward: f64,
        source: &str,
        discount: f64,
        allowed: &[EdgeType],
    ) -> HashMap<String, f64> {
        let mut rewards = HashMap::new();
        rewards.insert(source.to_string(), reward);
        if !self.nodes.contains_key(source) {
            warn!(node = source, "Reward source is not in the graph");
            return rewards;
        }

        let mut expanded: HashSet<&str> = HashSet::new();
        let mut queued: HashSet<&str> = HashSet::from([source]);
        let mut queue: VecDeque<&str> = VecDeque::from([source]);

        while let Some(current) = queue.pop_front() {
            if !expanded.insert(current) {
                continue;
            }
            let value = rewards.get(current).copied().unwrap_or(0.0);
            for pred in self.predecessors(current) {
                let pred = pred.as_str();
                if pred == source || expanded.contains(pred) {
                    continue;
                }
                let Some(edge) = self.edge(pred, current) else {
                    continue;
                };
                if !edge.active || !allowed.contains(&edge.edge_type) {
                    continue;
                }
                *rewards.entry(pred.to_string()).or_insert(0.0) += value * discount * edge.weight;
                if queued.insert(pred) {
                    queue.push_back(pred);
                }
            }
        }

        debug!(source, reached = rewards.len(), "Reward propagated");
        rewards
    }

    /// Hand `message` forward over successor links.
    ///
    /// Each reached node gets `{from, original, via_edge}` wrapping what its
    /// sender received. Every node is visited at most once.
    pub fn forward_pass(&self, source: &str, message: Value, allowed: &[EdgeType]) -> HashMap<String, Value> {
        let mut messages = HashMap::new();
        messages.insert(source.to_string(), message);
        let mut visited: HashSet<&str> = HashSet::from([source]);
        let mut queue: VecDeque<&str> = VecDeque::from([source]);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbors(current) {
                let next = next.as_str();
                if visited.contains(next) {
                    continue;
                }
                let Some(edge) = self.edge(current, next) else {
                    continue;
                };
                if !edge.active || !allowed.contains(&edge.edge_type) {
                    continue;
                }
                let wrapped = json!({
                    "from": current,
                    "original": messages.get(current).cloned().unwrap_or(Value::Null),
                    "via_edge": edge.id,
                });
                messages.insert(next.to_string(), wrapped);
                visited.insert(next);
                queue.push_back(next);
            }
        }
        messages
    }

    /// Every cycle found by a depth-first walk, each as `[n_k, …, n_k]`.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        for id in &self.order {
            if !visited.contains(id.as_str()) {
                let mut on_stack = HashSet::new();
                let mut path = Vec::new();
                self.cycle_dfs(id, &mut visited, &mut on_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn cycle_dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for next in self.neighbors(node) {
            let next = next.as_str();
            if !visited.contains(next) {
                self.cycle_dfs(next, visited, on_stack, path, cycles);
            } else if on_stack.contains(next) {
                if let Some(start) = path.iter().position(|n| *n == next) {
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    cycles.push(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
    }

    /// Longest simple path from `start` to `end` over active edges, by node
    /// count. Empty when `end` is unreachable.
    pub fn critical_path(&self, start: &str, end: &str) -> Vec<String> {
        if !self.nodes.contains_key(start) || !self.nodes.contains_key(end) {
            return Vec::new();
        }
        let mut best: Vec<&str> = Vec::new();
        let mut path = vec![start];
        self.longest_dfs(start, end, &mut path, &mut best);
        best.into_iter().map(str::to_string).collect()
    }

    fn longest_dfs<'a>(&'a self, node: &'a str, end: &str, path: &mut Vec<&'a str>, best: &mut Vec<&'a str>) {
        if node == end {
            if path.len() > best.len() {
                *best = path.clone();
            }
            return;
        }
        for next in self.neighbors(node) {
            let next = next.as_str();
            if path.contains(&next) {
                continue;
            }
            if !self.edge(node, next).is_some_and(|e| e.active) {
                continue;
            }
            path.push(next);
            self.longest_dfs(next, end, path, best);
            path.pop();
        }
    }

    /// Cheapest route from `source` to `target` over active edges.
    ///
    /// Crossing an edge costs `1 / weight`, or 1 when the weight is zero, so
    /// strong links are short. `None` when either end is missing or
    /// `target` is unreachable.
    pub fn shortest_path(&self, source: &str, target: &str) -> Option<GraphPath> {
        if !self.nodes.contains_key(source) || !self.nodes.contains_key(target) {
            return None;
        }
        let mut distance: HashMap<&str, f64> = HashMap::from([(source, 0.0)]);
        let mut previous: HashMap<&str, &str> = HashMap::new();
        let mut settled: HashSet<&str> = HashSet::new();

        loop {
            // Ties resolve to the earliest inserted node.
            let current = self
                .order
                .iter()
                .map(String::as_str)
                .filter(|id| !settled.contains(id))
                .filter_map(|id| distance.get(id).map(|d| (id, *d)))
                .fold(None, |best: Option<(&str, f64)>, (id, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((id, d)),
                });
            let Some((current, dist)) = current else {
                return None;
            };
            if current == target {
                break;
            }
            settled.insert(current);

            for next in self.neighbors(current) {
                let next = next.as_str();
                if settled.contains(next) {
                    continue;
                }
                let Some(edge) = self.edge(current, next).filter(|e| e.active) else {
                    continue;
                };
                let step = if edge.weight > 0.0 { 1.0 / edge.weight } else { 1.0 };
                let candidate = dist + step;
                if distance.get(next).map_or(true, |d| candidate < *d) {
                    distance.insert(next, candidate);
                    previous.insert(next, current);
                }
            }
        }

        let mut nodes = vec![target.to_string()];
        let mut cursor = target;
        while let Some(&prev) = previous.get(cursor) {
            nodes.push(prev.to_string());
            cursor = prev;
        }
        nodes.reverse();
        Some(GraphPath {
            nodes,
            cost: distance.get(target).copied().unwrap_or(0.0),
        })
    }

    /// Every simple path from `source` to `target` with at most
    /// `max_depth` hops, in depth-first order. Inactive edges are skipped.
    pub fn all_paths(&self, source: &str, target: &str, max_depth: usize) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        if !self.nodes.contains_key(source) || !self.nodes.contains_key(target) {
            return paths;
        }
        let mut path = vec![source];
        self.paths_dfs(source, target, max_depth, &mut path, &mut paths);
        paths
    }

    fn paths_dfs<'a>(
        &'a self,
        node: &'a str,
        target: &str,
        max_depth: usize,
        path: &mut Vec<&'a str>,
        paths: &mut Vec<Vec<String>>,
    ) {
        if node == target {
            paths.push(path.iter().map(|s| s.to_string()).collect());
            return;
        }
        if path.len() > max_depth {
            return;
        }
        for next in self.neighbors(node) {
            let next = next.as_str();
            if path.contains(&next) || !self.edge(node, next).is_some_and(|e| e.active) {
                continue;
            }
            path.push(next);
            self.paths_dfs(next, target, max_depth, path, paths);
            path.pop();
        }
    }

    /// Degree centrality: `(in + out) / (2 × (n - 1))`, 0 for a lone node.
    pub fn centrality(&self) -> BTreeMap<String, f64> {
        let n = self.nodes.len();
        self.nodes
            .values()
            .map(|node| {
                let score = if n > 1 {
                    (node.incoming.len() + node.outgoing.len()) as f64 / (2 * (n - 1)) as f64
                } else {
                    0.0
                };
                (node.id.clone(), score)
            })
            .collect()
    }

    /// Mermaid flowchart with one subgraph per stage.
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TB".to_string()];
        for stage in Stage::ALL {
            lines.push(format!("    subgraph {}", stage.name()));
            for node in self.stage_nodes(stage) {
                lines.push(format!("        {}[{}]", node.id, node.agent_type));
            }
            lines.push("    end".to_string());
        }
        for edge in self.edges() {
            let arrow = if edge.active { "-->" } else { "-.->" };
            lines.push(format!("    {} {arrow}|{}| {}", edge.source, edge.edge_type, edge.target));
        }
        lines.join("\n")
    }

    /// Compact JSON view: node ids, types, stages and values plus every edge.
    pub fn to_json(&self) -> Value {
        let nodes: Vec<Value> = self
            .nodes()
            .map(|n| {
                json!({
                    "id": n.id,
                    "type": n.agent_type,
                    "stage": n.stage,
                    "value": n.value,
                })
            })
            .collect();
        let edges: Vec<Value> = self
            .edges()
            .map(|e| {
                json!({
                    "id": e.id,
                    "source": e.source,
                    "target": e.target,
                    "type": e.edge_type,
                    "weight": e.weight,
                    "active": e.active,
                })
            })
            .collect();
        json!({ "nodes": nodes, "edges": edges })
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut nodes_per_stage = BTreeMap::new();
        for node in self.nodes.values() {
            *nodes_per_stage.entry(node.stage).or_insert(0) += 1;
        }
        let mut edges_per_type = BTreeMap::new();
        for edge in self.edges.values() {
            *edges_per_type.entry(edge.edge_type).or_insert(0) += 1;
        }
        GraphStatistics {
            total_nodes: self.nodes.len(),
            total_edges: self.edges.len(),
            nodes_per_stage,
            edges_per_type,
            average_out_degree: self.edges.len() as f64 / self.nodes.len().max(1) as f64,
            has_cycles: !self.detect_cycles().is_empty(),
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes().cloned().collect(),
            edges: self.edges().cloned().collect(),
        }
    }

    /// Rebuild a graph, re-validating every node and edge.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut graph = Self::new();
        for node in snapshot.nodes {
            graph.add_node(node);
        }
        for edge in snapshot.edges {
            graph.add_edge(edge);
        }
        graph
    }
}

impl PolicyStore for TopologyGraph {
    fn policy(&self, agent_id: &str) -> Option<&Policy> {
        self.nodes.get(agent_id).map(|n| &n.policy)
    }

    fn policy_mut(&mut self, agent_id: &str) -> Option<&mut Policy> {
        self.nodes.get_mut(agent_id).map(|n| &mut n.policy)
    }
}
