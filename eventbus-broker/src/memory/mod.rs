//! 进程内消息中间件
//!
//! 实现 AMQP 0-9-1 中总线用到的子集：默认/direct/fanout/topic 交换机、
//! 持久化/独占/自动删除队列、消息与队列级 TTL、死信交换机、prefetch、
//! 手动确认，以及连接断开时的重新入队。连接须显式关闭；channel 被丢弃时
//! 自动关闭，其未确认的消息重新入队。另外提供若干故障注入钩子，用于
//! 模拟网络中断和中间件重启。
//!
mod state;

pub use state::{DEATH_QUEUE_HEADER, DEATH_REASON_HEADER};

use crate::broker::{Broker, Channel, Connection, DeliveryStream};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Delivery, Message};
use crate::topology::{ExchangeSpec, QueueInfo, QueueSpec};
use async_trait::async_trait;
use state::{BrokerState, Effects};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 进程内消息中间件；克隆共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    confirm_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 在锁内执行一次状态变更并推进投递，锁外调度过期检查
    fn apply<R>(self: &Arc<Self>, f: impl FnOnce(&mut BrokerState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut state = self.lock();
            let result = f(&mut state, &mut fx);
            state.settle(&mut fx);
            result
        };
        self.schedule(fx.timers);
        result
    }

    fn schedule(self: &Arc<Self>, timers: Vec<(String, Instant)>) {
        if timers.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // 没有运行时：过期消息在下一次投递时处理
            debug!("no runtime, message expiry checked lazily");
            return;
        };
        for (queue, at) in timers {
            let weak: Weak<BrokerInner> = Arc::downgrade(self);
            handle.spawn(async move {
                tokio::time::sleep_until(at).await;
                if let Some(inner) = weak.upgrade() {
                    inner.apply(|state, fx| state.expire(&queue, fx));
                }
            });
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                confirm_delay: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// 不可用时新的连接请求失败（已建立的连接不受影响）
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// 延迟中间件接收发布的消息，用于模拟确认超时；等待期间被放弃的发布不会入队
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        *self
            .inner
            .confirm_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// 模拟网络中断：服务端关闭所有连接，拓扑与消息保留
    pub fn disconnect_all(&self) {
        info!("dropping all connections");
        self.inner.apply(|state, fx| {
            for connection in state.connection_ids() {
                state.close_connection(connection, fx);
            }
        });
    }

    /// 服务端关闭单个连接
    pub fn disconnect(&self, connection: u64) {
        info!(connection, "dropping connection");
        self.inner
            .apply(|state, fx| state.close_connection(connection, fx));
    }

    /// 服务端取消队列上的所有消费者（例如队列被删除），连接与 channel 保持打开
    pub fn cancel_consumers(&self, queue: &str) {
        info!(queue, "cancelling consumers");
        self.inner
            .apply(|state, fx| state.cancel_queue_consumers(queue, fx));
    }

    /// 模拟中间件重启：关闭所有连接，丢弃非持久化的交换机与队列
    pub fn restart(&self) {
        info!("restarting broker");
        self.inner.apply(|state, fx| state.restart(fx));
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connection_count()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.lock().queue_names()
    }

    pub fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        self.inner.lock().queue_info(None, queue).ok()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.lock().exchange_exists(exchange)
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.inner.lock().has_binding(exchange, queue, routing_key)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn Connection>> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        let id = self.inner.next_id();
        let token = CancellationToken::new();
        self.inner.lock().open_connection(id, token.clone());
        debug!(connection = id, "connection opened");

        Ok(Arc::new(InMemoryConnection {
            id,
            inner: self.inner.clone(),
            token,
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    inner: Arc<BrokerInner>,
    token: CancellationToken,
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn Channel>> {
        if self.token.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = self.inner.next_id();
        let token = self.token.child_token();
        self.inner.lock().open_channel(id, self.id, token.clone());

        Ok(Arc::new(InMemoryChannel {
            id,
            connection: self.id,
            inner: self.inner.clone(),
            connection_token: self.token.clone(),
            token,
        }))
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    async fn close(&self) {
        let id = self.id;
        self.inner.apply(|state, fx| state.close_connection(id, fx));
    }
}

struct InMemoryChannel {
    id: u64,
    connection: u64,
    inner: Arc<BrokerInner>,
    connection_token: CancellationToken,
    token: CancellationToken,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.connection_token.is_cancelled() {
            Err(BrokerError::ConnectionClosed)
        } else if self.token.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        self.inner.lock().declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<QueueInfo> {
        self.ensure_open()?;
        self.inner.lock().declare_queue(self.connection, spec)
    }

    async fn queue_info(&self, queue: &str) -> BrokerResult<QueueInfo> {
        self.ensure_open()?;
        self.inner.lock().queue_info(Some(self.connection), queue)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.inner
            .lock()
            .bind(self.connection, queue, exchange, routing_key)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.inner.lock().unbind(queue, exchange, routing_key);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> BrokerResult<usize> {
        self.ensure_open()?;
        self.inner.lock().delete_queue(self.connection, queue)
    }

    async fn publish(&self, exchange: &str, message: Message) -> BrokerResult<()> {
        self.ensure_open()?;
        let delay = *self
            .inner
            .confirm_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_open()?;
        }

        self.inner
            .apply(|state, fx| state.publish(exchange, message, fx))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let (connection, channel) = (self.connection, self.id);
        self.inner.apply(|state, fx| {
            state.add_consumer(connection, channel, queue, consumer_tag, prefetch, tx, fx)
        })?;
        debug!(queue, consumer_tag, "consumer started");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let channel = self.id;
        self.inner
            .apply(|state, fx| state.cancel_consumer(channel, consumer_tag, fx));
        Ok(())
    }

    async fn get(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        self.ensure_open()?;
        let (connection, channel) = (self.connection, self.id);
        self.inner
            .apply(|state, fx| state.get(connection, channel, queue, fx))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        let channel = self.id;
        self.inner
            .apply(|state, fx| state.ack(channel, delivery_tag, fx))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let channel = self.id;
        self.inner
            .apply(|state, fx| state.nack(channel, delivery_tag, requeue, fx))
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let channel = self.id;
        self.inner.apply(|state, fx| state.close_channel(channel, fx));
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            let channel = self.id;
            self.inner.apply(|state, fx| state.close_channel(channel, fx));
        }
    }
}
