use stratum_core::config::AppConfig;
use stratum_core::{Stage, StratumError};
use stratum_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[orchestrator]
max_iterations = 7
reward_threshold = 0.75
timeout_secs = 0
enable_learning = false
enable_streaming = true
batch_size = 8

[experience]
capacity = 512
prioritized = true
alpha = 0.7
seed = 42

[policy]
learning_rate = 0.01
clip_epsilon = 0.1
batch_size = 4

[reward]
weighted_share = 0.5

[reward.stage_weights]
decision = 0.2
implementation = 0.5
validation = 0.3

[reward.component_weights]
decision_quality = 0.6

[bus]
stages = [1, 3]
response_timeout_secs = 5

[feedback]
priority_threshold = 6
max_suggestions = 2

[roster]
decision = ["planner"]
implementation_groups = [["coder"], ["reviewer", "tester"]]
validation = ["auditor"]

[log]
filter = "stratum=debug"
"#;

    let tmp = write_config(toml_content);
    let config = AppConfig::load(tmp.path()).expect("load config");
    config.validate().expect("valid config");

    assert_eq!(config.orchestrator.max_iterations, 7);
    assert_eq!(config.orchestrator.reward_threshold, 0.75);
    assert_eq!(config.orchestrator.timeout_secs, 0);
    assert!(!config.orchestrator.enable_learning);
    assert!(config.orchestrator.enable_streaming);
    assert_eq!(config.orchestrator.batch_size, 8);

    assert_eq!(config.experience.capacity, 512);
    assert!(config.experience.prioritized);
    assert_eq!(config.experience.alpha, 0.7);
    assert_eq!(config.experience.seed, Some(42));

    assert_eq!(config.policy.learning_rate, 0.01);
    assert_eq!(config.policy.clip_epsilon, 0.1);
    assert_eq!(config.policy.batch_size, 4);

    assert_eq!(config.reward.weighted_share, 0.5);
    assert_eq!(config.reward.stage_weights.get(Stage::Implementation), 0.5);
    assert_eq!(config.reward.component_weights.get("decision_quality"), Some(&0.6));

    assert_eq!(config.bus.hosted_stages(), vec![Stage::Decision, Stage::Validation]);
    assert_eq!(config.bus.response_timeout_secs, 5);

    assert_eq!(config.feedback.priority_threshold, 6);
    assert_eq!(config.feedback.max_suggestions, 2);

    assert_eq!(config.roster.agents(Stage::Decision), vec!["planner"]);
    assert_eq!(
        config.roster.agents(Stage::Implementation),
        vec!["coder", "reviewer", "tester"]
    );
    assert_eq!(config.roster.agents(Stage::Validation), vec!["auditor"]);

    assert_eq!(config.log.filter, "stratum=debug");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config("");
    let config = AppConfig::load(tmp.path()).expect("load config");
    config.validate().expect("defaults are valid");

    assert_eq!(config.orchestrator.max_iterations, 3);
    assert_eq!(config.orchestrator.reward_threshold, 0.6);
    assert!(config.orchestrator.enable_learning);
    assert_eq!(config.experience.capacity, 10_000);
    assert!(!config.experience.prioritized);
    assert_eq!(config.bus.hosted_stages(), Stage::ALL.to_vec());
    assert_eq!(config.log.filter, "stratum=info,warn");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRATUM_TEST_DECISION_AGENT", "env-planner");
    let tmp = write_config(
        r#"
[roster]
decision = ["${STRATUM_TEST_DECISION_AGENT}", "${STRATUM_TEST_UNSET_AGENT}"]
"#,
    );
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.roster.agents(Stage::Decision),
        vec!["env-planner", "${STRATUM_TEST_UNSET_AGENT}"]
    );
    std::env::remove_var("STRATUM_TEST_DECISION_AGENT");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, StratumError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let tmp = write_config("[orchestrator\nmax_iterations = ");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, StratumError::Config(_)));
}

#[test]
fn test_validation_collects_every_problem() {
    let tmp = write_config(
        r#"
[orchestrator]
max_iterations = 0

[policy]
batch_size = 0

[bus]
stages = [4]

[roster]
validation = []
"#,
    );
    let config = AppConfig::load(tmp.path()).expect("parse config");
    let err = config.validate().unwrap_err();
    let StratumError::Config(message) = err else {
        panic!("expected config error, got {err:?}");
    };
    assert!(message.contains("orchestrator.max_iterations"));
    assert!(message.contains("policy.batch_size"));
    assert!(message.contains("bus.stages contains unknown stage 4"));
    assert!(message.contains("roster.validation has no agents"));
}
