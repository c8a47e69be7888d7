//! Ties the pieces together: the engine-wide config, the fault router, and
//! (indirectly, via [`crate::harness`]) the TAP sink. One [`Engine`] is
//! shared (via `Arc`) by every [`crate::context::Context`] descended from a
//! single root harness run.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::fault::FaultRouter;

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) fault: Arc<FaultRouter>,
}

impl Engine {
    pub(crate) fn new(config: EngineConfig, fault: Arc<FaultRouter>) -> Arc<Self> {
        Arc::new(Self { config, fault })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
