use stratum_agent::{GraphBuilder, Orchestrator};
use stratum_core::config::{AppConfig, RosterConfig};
use stratum_core::{RunEvent, RunStatus, Stage};
use stratum_test_utils::{scripted_pipeline, ConstantScorer};

fn config(threshold: f64, max_iterations: usize, weighted_share: f64) -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.reward_threshold = threshold;
    config.orchestrator.max_iterations = max_iterations;
    config.reward.weighted_share = weighted_share;
    config
}

#[tokio::test]
async fn test_scorer_drives_convergence() {
    let (d, i, v) = scripted_pipeline(&[0.0]);
    let mut orch = Orchestrator::new(config(0.6, 5, 1.0), d, i, v)
        .unwrap()
        .with_scorer(Box::new(ConstantScorer(1.0)));
    let outcome = orch.run("tune the cache").await.unwrap();
    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 1);
    assert!((outcome.final_reward - 1.0).abs() < 1e-9);

    let (d, i, v) = scripted_pipeline(&[1.0]);
    let mut orch = Orchestrator::new(config(0.6, 3, 1.0), d, i, v)
        .unwrap()
        .with_scorer(Box::new(ConstantScorer(0.5)));
    let outcome = orch.run("tune the cache").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.reward_history.iter().all(|r| (r - 0.5).abs() < 1e-9));
}

#[tokio::test]
async fn test_blended_reward_mixes_signal_and_stages() {
    let (d, i, v) = scripted_pipeline(&[0.2]);
    let mut orch = Orchestrator::new(config(0.9, 1, 0.5), d, i, v)
        .unwrap()
        .with_scorer(Box::new(ConstantScorer(1.0)));
    let outcome = orch.run("task").await.unwrap();
    assert!((outcome.final_reward - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_outcome_serializes_to_json() {
    let (d, i, v) = scripted_pipeline(&[0.7]);
    let mut orch = Orchestrator::new(config(0.6, 3, 0.0), d, i, v).unwrap();
    let outcome = orch.run("summarize logs").await.unwrap();

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "converged");
    assert_eq!(json["iterations"], 1);
    assert_eq!(json["final_task"], "summarize logs");
    assert_eq!(json["decision"]["tasks"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["implementations"].as_array().map(Vec::len), Some(2));
    assert!(json["session_id"].is_string());
}

#[tokio::test]
async fn test_consecutive_runs_share_learning_state() {
    let mut cfg = config(0.99, 2, 0.0);
    cfg.orchestrator.batch_size = 2;
    cfg.policy.batch_size = 1;
    cfg.experience.seed = Some(3);
    let (d, i, v) = scripted_pipeline(&[0.4, 0.8]);
    let mut orch = Orchestrator::new(cfg, d, i, v).unwrap();

    let first = orch.run("first").await.unwrap();
    let stored = orch.experience().len();
    let second = orch.run("second").await.unwrap();

    assert_ne!(first.session_id, second.session_id);
    assert!(orch.experience().len() > stored);
    let stats = orch.stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.trajectories.total, 4);
    assert_eq!(stats.feedback.count, 4);
    assert!(serde_json::to_string(&stats).is_ok());
}

#[tokio::test]
async fn test_custom_roster_graph() {
    let roster = RosterConfig {
        decision: vec!["planner".into()],
        implementation_groups: vec![vec!["coder".into()]],
        validation: vec!["auditor".into()],
    };
    let mut cfg = config(0.6, 2, 0.0);
    cfg.roster = roster.clone();
    let graph = GraphBuilder::new().with_policy_config(&cfg.policy).hierarchical(&roster);

    let (d, i, v) = scripted_pipeline(&[0.9]);
    let mut orch = Orchestrator::new(cfg, d, i, v).unwrap().with_graph(graph);
    let mut events = orch.runtime().event_bus.subscribe();
    orch.run("task").await.unwrap();

    assert_eq!(orch.graph().node_count(), 3);
    assert_eq!(orch.graph().stage_nodes(Stage::Implementation).len(), 1);
    assert!(orch.graph().detect_cycles().iter().any(|c| c.contains(&"auditor".to_string())));

    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::RunFinished { status, iterations, .. } = event {
            assert_eq!(status, RunStatus::Converged);
            assert_eq!(iterations, 1);
            finished = true;
        }
    }
    assert!(finished);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (d, i, v) = scripted_pipeline(&[0.5]);
    let mut cfg = AppConfig::default();
    cfg.orchestrator.max_iterations = 0;
    assert!(Orchestrator::new(cfg, d, i, v).is_err());
}
