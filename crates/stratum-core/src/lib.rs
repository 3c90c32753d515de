pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod stage;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StratumError};
pub use event::EventBus;
pub use message::{ContractRegistry, Message, MessageContract, MessageType, Payload};
pub use stage::*;
pub use traits::{PolicyStore, StageProcessor, ValueFunction};
pub use types::*;
