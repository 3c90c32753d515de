use thiserror::Error;

use crate::types::Stage;

#[derive(Debug, Error)]
pub enum StratumError {
    // Stage errors
    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("Invalid stage number: {0}")]
    InvalidStage(u8),

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    // Bus errors
    #[error("Communication bus is not running")]
    BusNotRunning,

    #[error("Communication bus already started")]
    BusAlreadyRunning,

    #[error("Stage {0} is not hosted on this bus")]
    StageNotHosted(Stage),

    #[error("A response waiter is already registered for message {0}")]
    DuplicateWaiter(String),

    #[error("Message {message_id} violates its contract: {}", violations.join("; "))]
    ContractViolation {
        message_id: String,
        violations: Vec<String>,
    },

    #[error("Subscriber failed: {0}")]
    Subscriber(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StratumError {
    /// Wrap any displayable error as a failure of the given stage.
    pub fn stage(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::StageFailed {
            stage,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;
