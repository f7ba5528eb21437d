//! 按路由键注册（KeyRegistration）
//!
//! 每个实例持有一个私有队列（独占、自动删除），按注册的路由键绑定到主交换机。
//! 同一路由键的第一个本地监听器建立绑定，最后一个注销时解除绑定。
//! 私有队列只有一个消费者，收到事件后推给本地所有路由键匹配的监听器；
//! 不做重试：失败记录日志后丢弃。
//!
use dashmap::DashMap;
use eventbus_broker::routing::topic_matches;
use eventbus_broker::{Channel, ConnectionPool, Delivery, QueueSpec};
use eventbus_domain::{EventBusId, EventListener, EventSerializer, RegistrationKey};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::ChannelSlot;
use crate::codec;
use crate::consumer::{self, ConsumerHandle, ListenerEntry, Subscribed};
use crate::error::BusResult;
use crate::topology::BusTopology;

/// 私有队列的 prefetch
const KEY_CONSUMER_PREFETCH: u16 = 64;

type KeyListeners = DashMap<RegistrationKey, Vec<ListenerEntry>>;

pub struct KeyRegistrations {
    id: EventBusId,
    topology: BusTopology,
    pool: ConnectionPool,
    serializer: Arc<dyn EventSerializer>,
    slot: ChannelSlot,
    listeners: Arc<KeyListeners>,
    /// 串行化绑定/解绑，保证"首个注册绑定、最后一个注销解绑"
    bindings: Arc<Mutex<()>>,
    consumer: Mutex<Option<ConsumerHandle>>,
    next_id: AtomicU64,
}

impl KeyRegistrations {
    pub(crate) fn new(
        id: EventBusId,
        topology: BusTopology,
        pool: ConnectionPool,
        serializer: Arc<dyn EventSerializer>,
    ) -> Self {
        Self {
            id,
            topology,
            slot: ChannelSlot::new(pool.clone()),
            pool,
            serializer,
            listeners: Arc::new(DashMap::new()),
            bindings: Arc::new(Mutex::new(())),
            consumer: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// 本实例私有队列的名称
    pub fn queue_name(&self) -> String {
        self.topology.naming().event_bus_queue(&self.id)
    }

    /// 当前有本地监听器的路由键
    pub fn keys(&self) -> Vec<RegistrationKey> {
        self.listeners.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) async fn start(&self) -> BusResult<()> {
        self.spawn_consumer().await
    }

    pub(crate) async fn register(
        &self,
        key: RegistrationKey,
        listener: Arc<dyn EventListener>,
    ) -> BusResult<u64> {
        let _bindings = self.bindings.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.listeners.contains_key(&key) {
            self.bind(&key).await?;
            debug!(key = %key, queue = %self.queue_name(), "key bound");
        }
        self.listeners
            .entry(key)
            .or_default()
            .push(ListenerEntry { id, listener });
        Ok(id)
    }

    /// 注销一个监听器；该路由键的最后一个监听器注销时解除绑定
    pub(crate) async fn unregister(&self, key: &RegistrationKey, id: u64) -> BusResult<()> {
        let _bindings = self.bindings.lock().await;

        let now_empty = match self.listeners.get_mut(key) {
            Some(mut entries) => {
                entries.retain(|entry| entry.id != id);
                entries.is_empty()
            }
            None => return Ok(()),
        };
        if now_empty {
            self.listeners.remove(key);
            if let Err(e) = self.unbind(key).await {
                // 私有队列随连接一起消失时绑定也已不存在
                warn!(key = %key, error = %e, "failed to unbind key");
            } else {
                debug!(key = %key, "key unbound");
            }
        }
        Ok(())
    }

    /// 连接重建后：重新声明私有队列、恢复所有绑定并替换消费者
    pub(crate) async fn restore(&self) -> BusResult<()> {
        self.slot.reset().await;
        self.spawn_consumer().await?;
        info!(queue = %self.queue_name(), keys = self.listeners.len(), "key registrations restored");
        Ok(())
    }

    /// 停止消费并删除私有队列
    pub(crate) async fn stop(&self) {
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.stop().await;
        }

        let queue = self.queue_name();
        let name = queue.as_str();
        if let Err(e) = self
            .slot
            .run(|channel| async move { channel.delete_queue(name).await })
            .await
        {
            warn!(queue = name, error = %e, "failed to delete instance queue");
        }
        self.listeners.clear();
        self.slot.close().await;
    }

    async fn bind(&self, key: &RegistrationKey) -> BusResult<()> {
        let queue = self.queue_name();
        let exchange = self.topology.naming().exchange();
        let (queue, exchange, key) = (queue.as_str(), exchange.as_str(), key.as_str());
        self.slot
            .run(|channel| async move { channel.bind_queue(queue, exchange, key).await })
            .await?;
        Ok(())
    }

    async fn unbind(&self, key: &RegistrationKey) -> BusResult<()> {
        let queue = self.queue_name();
        let exchange = self.topology.naming().exchange();
        let (queue, exchange, key) = (queue.as_str(), exchange.as_str(), key.as_str());
        self.slot
            .run(|channel| async move { channel.unbind_queue(queue, exchange, key).await })
            .await?;
        Ok(())
    }

    async fn spawn_consumer(&self) -> BusResult<()> {
        let queue = InstanceQueue {
            spec: self.topology.instance_queue(&self.id),
            exchange: self.topology.naming().exchange(),
            consumer_tag: format!("key-{}", self.id),
            pool: self.pool.clone(),
            listeners: self.listeners.clone(),
            bindings: self.bindings.clone(),
        };
        let listeners = self.listeners.clone();
        let serializer = self.serializer.clone();
        let handle = ConsumerHandle::start(
            format!("key:{}", self.queue_name()),
            *self.pool.config(),
            move || {
                let queue = queue.clone();
                async move { queue.subscribe().await }
            },
            move |channel, delivery| {
                let listeners = listeners.clone();
                let serializer = serializer.clone();
                async move { deliver(&listeners, &*serializer, &*channel, delivery).await }
            },
        )
        .await?;

        if let Some(previous) = self.consumer.lock().await.replace(handle) {
            previous.shutdown();
        }
        Ok(())
    }
}

/// 私有队列的订阅：声明队列、补齐当前所有路由键的绑定，再开始消费。
/// 队列随连接或最后一个消费者消失后，重新订阅即可完整恢复。
#[derive(Clone)]
struct InstanceQueue {
    spec: QueueSpec,
    exchange: String,
    consumer_tag: String,
    pool: ConnectionPool,
    listeners: Arc<KeyListeners>,
    bindings: Arc<Mutex<()>>,
}

impl InstanceQueue {
    async fn subscribe(&self) -> BusResult<Subscribed> {
        let _bindings = self.bindings.lock().await;
        let channel = self.pool.channel().await?;
        channel.declare_queue(&self.spec).await?;
        let keys: Vec<RegistrationKey> = self
            .listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            channel
                .bind_queue(self.spec.name(), &self.exchange, key.as_str())
                .await?;
        }
        let stream = channel
            .consume(self.spec.name(), &self.consumer_tag, KEY_CONSUMER_PREFETCH)
            .await?;
        Ok((channel, stream))
    }
}

async fn deliver(
    listeners: &KeyListeners,
    serializer: &dyn EventSerializer,
    channel: &dyn Channel,
    delivery: Delivery,
) {
    match codec::decode(serializer, &delivery.message) {
        Ok(envelope) => {
            let event = envelope.event();
            let matching: Vec<Arc<dyn EventListener>> = listeners
                .iter()
                .filter(|entry| topic_matches(entry.key().as_str(), event.routing_key()))
                .flat_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .map(|e| e.listener.clone())
                        .collect::<Vec<_>>()
                })
                .collect();

            for listener in matching {
                if !listener.is_handling(event) {
                    continue;
                }
                if let Err(e) = consumer::invoke(&*listener, event).await {
                    warn!(
                        listener = listener.name(),
                        event_id = %event.event_id(),
                        error = %format!("{e:#}"),
                        "key listener failed, event dropped"
                    );
                }
            }
        }
        Err(e) => warn!(error = %e, "undecodable message on instance queue, dropped"),
    }

    if let Err(e) = channel.ack(delivery.delivery_tag).await {
        debug!(error = %e, "ack failed, message will be redelivered");
    }
}
