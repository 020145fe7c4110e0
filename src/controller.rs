//! Start/stop capability for modeled resources.
//!
//! The concrete drivers live outside this crate; the coordinator only needs
//! to resume entities after promotion and to forward stop requests.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::rebind::LiveEntity;

#[async_trait]
pub trait EntityController: Send + Sync {
    /// Brings an entity back to its running state after a takeover.
    async fn resume(&self, entity: &LiveEntity) -> Result<()>;

    async fn stop(&self, entity_id: &str) -> Result<()>;
}

/// Controller that only logs; used when no driver is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingController;

#[async_trait]
impl EntityController for LoggingController {
    async fn resume(&self, entity: &LiveEntity) -> Result<()> {
        info!(entity_id = %entity.id, entity_type = %entity.entity_type, "Resuming entity");
        Ok(())
    }

    async fn stop(&self, entity_id: &str) -> Result<()> {
        info!(entity_id, "Stopping entity");
        Ok(())
    }
}
