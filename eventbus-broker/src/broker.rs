//! 消息中间件协议：Broker → Connection → Channel
//!
//! 一个进程内所有组件共享同一个连接，每个组件使用各自的 channel，避免
//! 互不相关的发布/消费流相互阻塞。连接随时可能断开：断开后其上的 channel
//! 全部失效，消费流结束，未确认的消息由中间件重新入队。
//!
use crate::error::BrokerResult;
use crate::message::{Delivery, Message};
use crate::topology::{ExchangeSpec, QueueInfo, QueueSpec};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::Arc;

/// 消费流：连接或 channel 关闭、消费者被取消时结束
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// 连接工厂
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> BrokerResult<Arc<dyn Channel>>;

    /// 连接关闭（主动或被动）时完成
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<QueueInfo>;

    /// 被动声明：队列不存在时返回 `NotFound`
    async fn queue_info(&self, queue: &str) -> BrokerResult<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> BrokerResult<()>;

    /// 删除队列，返回被丢弃的就绪消息数
    async fn delete_queue(&self, queue: &str) -> BrokerResult<usize>;

    /// 发布消息，在中间件确认（publisher confirm）后返回；无法路由的消息被静默丢弃
    async fn publish(&self, exchange: &str, message: Message) -> BrokerResult<()>;

    /// 开始消费；`prefetch` 为未确认消息上限（0 表示不限）
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// 拉取一条消息（需确认）
    async fn get(&self, queue: &str) -> BrokerResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
