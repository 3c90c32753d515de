pub mod bus;
pub mod feedback;
pub mod graph;
pub mod metrics;
pub mod orchestrator;
pub mod runtime;

pub use bus::{CommunicationBus, HistoryFilter, MessageHandler, QueueStats, SubscriptionId, TaskDispatcher};
pub use feedback::{FeedbackRecord, FeedbackRouter, FeedbackSummary};
pub use graph::{AgentNode, Edge, EdgeType, GraphBuilder, GraphPath, GraphSnapshot, GraphStatistics, TopologyGraph};
pub use metrics::{MetricSummary, MetricsCollector, PerformanceReport, PerformanceTracker};
pub use orchestrator::{
    DecisionProcessor, ImplementationProcessor, Orchestrator, OrchestratorStats, RunOutcome, ValidationProcessor,
};
pub use runtime::RuntimeContext;
