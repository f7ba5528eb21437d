//! 组件独占的 channel
//!
//! 每个组件在共享连接上持有自己的 channel；channel 或连接失效后，下一次
//! 使用时从连接池重新获取。
//!
use eventbus_broker::{BrokerResult, Channel, ConnectionPool};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub(crate) struct ChannelSlot {
    pool: ConnectionPool,
    slot: Mutex<Option<Arc<dyn Channel>>>,
}

impl ChannelSlot {
    pub(crate) fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            slot: Mutex::new(None),
        }
    }

    pub(crate) async fn get(&self) -> BrokerResult<Arc<dyn Channel>> {
        let mut slot = self.slot.lock().await;
        if let Some(channel) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }
        let channel = self.pool.channel().await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// 执行一次 channel 操作；连接类错误时换新 channel 重试一次
    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> BrokerResult<T>
    where
        F: Fn(Arc<dyn Channel>) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        match op(self.get().await?).await {
            Err(e) if e.is_connection_error() => {
                debug!(error = %e, "channel lost, retrying on a fresh channel");
                self.reset().await;
                op(self.get().await?).await
            }
            other => other,
        }
    }

    pub(crate) async fn reset(&self) {
        self.slot.lock().await.take();
    }

    pub(crate) async fn close(&self) {
        let channel = self.slot.lock().await.take();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
    }
}
