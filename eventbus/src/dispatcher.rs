//! 事件分发（Dispatcher）
//!
//! 事件只发布一次到主交换机，由绑定决定副本的去向；没有任何绑定匹配时
//! 由中间件静默丢弃，调用方不会收到错误。
//!
use eventbus_broker::ConnectionPool;
use eventbus_domain::{Event, EventEnvelope, EventSerializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codec;
use crate::error::BusResult;
use crate::publisher::Publisher;

pub struct Dispatcher {
    publisher: Publisher,
    serializer: Arc<dyn EventSerializer>,
    exchange: String,
}

impl Dispatcher {
    pub(crate) fn new(
        pool: ConnectionPool,
        serializer: Arc<dyn EventSerializer>,
        exchange: String,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            publisher: Publisher::new(pool, confirm_timeout),
            serializer,
            exchange,
        }
    }

    /// 序列化并发布，收到发布确认后返回
    pub async fn dispatch(&self, event: &Event) -> BusResult<()> {
        let message = codec::encode(&*self.serializer, &EventEnvelope::new(event.clone()))?;
        self.publisher.publish(&self.exchange, message).await?;
        debug!(
            event_id = %event.event_id(),
            routing_key = event.routing_key(),
            "event dispatched"
        );
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.publisher.close().await;
    }
}
