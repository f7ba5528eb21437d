//! 连接重建后恢复总线拓扑
//!
use async_trait::async_trait;
use eventbus_broker::{Connection, ReconnectionHandler};
use std::sync::{Arc, Weak};
use tracing::info;

use crate::distributed::BusInner;

pub(crate) struct BusReconnectionHandler {
    bus: Weak<BusInner>,
}

impl BusReconnectionHandler {
    pub(crate) fn new(bus: Weak<BusInner>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ReconnectionHandler for BusReconnectionHandler {
    fn name(&self) -> &str {
        "eventbus-topology"
    }

    async fn handle_reconnection(&self, connection: Arc<dyn Connection>) -> anyhow::Result<()> {
        let Some(bus) = self.bus.upgrade() else {
            return Ok(());
        };
        if !bus.is_started() {
            return Ok(());
        }
        bus.restore(connection).await;
        info!(bus_id = %bus.id(), "event bus topology restored");
        Ok(())
    }
}
