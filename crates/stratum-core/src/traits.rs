use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Result;
use crate::stage::StageContext;
use crate::types::{state_key, Policy, Stage, StateSnapshot};

/// A pipeline stage the orchestrator invokes and scores.
///
/// Prompting, model calls and output parsing live behind this trait.
pub trait StageProcessor: Send + Sync + 'static {
    type Output: Send + 'static;

    /// The stage this processor serves.
    fn stage(&self) -> Stage;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        self.stage().name()
    }

    /// Run the stage to completion.
    fn process(&self, ctx: StageContext) -> BoxFuture<'_, Result<Self::Output>>;

    /// Incremental text produced while processing. Used only when
    /// streaming is enabled; the default produces nothing.
    fn process_stream(&self, ctx: StageContext) -> BoxStream<'_, String> {
        let _ = ctx;
        futures::stream::empty().boxed()
    }
}

/// State value estimate used by advantage computation.
pub trait ValueFunction {
    fn value(&self, state: &StateSnapshot) -> f64;
}

/// Lookup table keyed by [`state_key`]. Unseen states are worth 0.
impl ValueFunction for HashMap<String, f64> {
    fn value(&self, state: &StateSnapshot) -> f64 {
        self.get(&state_key(state)).copied().unwrap_or(0.0)
    }
}

/// Access to per-agent policies, keyed by agent id.
pub trait PolicyStore {
    fn policy(&self, agent_id: &str) -> Option<&Policy>;

    fn policy_mut(&mut self, agent_id: &str) -> Option<&mut Policy>;
}

impl PolicyStore for HashMap<String, Policy> {
    fn policy(&self, agent_id: &str) -> Option<&Policy> {
        self.get(agent_id)
    }

    fn policy_mut(&mut self, agent_id: &str) -> Option<&mut Policy> {
        self.get_mut(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_table_defaults_to_zero() {
        let mut state = StateSnapshot::new();
        state.insert("iteration".into(), serde_json::json!(1));

        let mut table: HashMap<String, f64> = HashMap::new();
        assert_eq!(table.value(&state), 0.0);

        table.insert(state_key(&state), 0.75);
        assert_eq!(table.value(&state), 0.75);
    }

    #[test]
    fn test_policy_map_store() {
        let mut store: HashMap<String, Policy> = HashMap::new();
        store.insert("critic".into(), Policy::new("critic", Stage::Decision));
        assert!(store.policy("critic").is_some());
        assert!(store.policy("nobody").is_none());
        store.policy_mut("critic").unwrap().set_exploration_rate(0.5);
        assert_eq!(store.policy("critic").unwrap().exploration_rate, 0.5);
    }
}
