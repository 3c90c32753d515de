//! Scripted stage processors and fixtures shared by Stratum's tests.

pub mod fixtures;
pub mod processors;

pub use fixtures::{
    decision_with_tasks, implementation, transitions, validation_with_issues, write_config, ConstantScorer,
};
pub use processors::{
    failing_stage, scripted_pipeline, FailingStage, ScriptedDecision, ScriptedImplementation, ScriptedValidation,
};
