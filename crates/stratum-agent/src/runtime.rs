use std::sync::Arc;

use stratum_core::config::AppConfig;
use stratum_core::event::EventBus;
use tokio_util::sync::CancellationToken;

use crate::bus::CommunicationBus;

/// Shared handles for one orchestrator: configuration, the stage bus, the
/// run-event bus and the cancellation token they hang off.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<AppConfig>,
    pub bus: Arc<CommunicationBus>,
    pub event_bus: Arc<EventBus>,
    pub cancel: CancellationToken,
}

impl RuntimeContext {
    pub fn new(config: AppConfig) -> Self {
        let cancel = CancellationToken::new();
        let bus = CommunicationBus::new(&config.bus).with_parent_cancel(&cancel);
        Self {
            config: Arc::new(config),
            bus: Arc::new(bus),
            event_bus: Arc::new(EventBus::default()),
            cancel,
        }
    }

    /// Cancel everything tied to this context, including the bus dispatchers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_bus() {
        let ctx = RuntimeContext::new(AppConfig::default());
        ctx.bus.start().unwrap();
        assert!(ctx.bus.is_running());
        ctx.shutdown();
        assert!(!ctx.bus.is_running());
        assert!(ctx.cancel.is_cancelled());
    }
}
