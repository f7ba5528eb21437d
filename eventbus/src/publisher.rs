//! 带确认超时的发布
//!
use eventbus_broker::{ConnectionPool, Message};
use std::time::Duration;
use tracing::warn;

use crate::channel::ChannelSlot;
use crate::error::{BusError, BusResult};

pub(crate) struct Publisher {
    slot: ChannelSlot,
    confirm_timeout: Duration,
}

impl Publisher {
    pub(crate) fn new(pool: ConnectionPool, confirm_timeout: Duration) -> Self {
        Self {
            slot: ChannelSlot::new(pool),
            confirm_timeout,
        }
    }

    /// 发布并等待确认；channel 失效时重试一次，整体受确认超时约束
    pub(crate) async fn publish(&self, exchange: &str, message: Message) -> BusResult<()> {
        let publish = self.slot.run(|channel| {
            let message = message.clone();
            async move { channel.publish(exchange, message).await }
        });

        match tokio::time::timeout(self.confirm_timeout, publish).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(exchange, timeout = ?self.confirm_timeout, "publisher confirm timed out");
                // 确认状态未知的 channel 不再复用
                self.slot.reset().await;
                Err(BusError::ConfirmTimeout {
                    timeout: self.confirm_timeout,
                })
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.slot.close().await;
    }
}
