//! 按消费组注册（GroupRegistration）
//!
//! 每个组一个持久化工作队列，以 `#` 绑定主交换机；所有注册了该组的实例
//! 竞争消费同一个队列，因此每个事件只由一个实例处理。
//!
//! 本地状态机：`UNBOUND → BOUND → UNBOUND`。首个本地监听器注册时声明组拓扑
//! 并启动唯一的消费任务；最后一个注销时停止本地消费，队列与绑定保留给其他
//! 实例。
//!
//! 失败处理不使用进程内定时器：
//! - 未耗尽重试：带 `retry_count + 1` 与消息过期时间发布到组重试交换机，
//!   重试队列中的消息过期后由中间件转回工作队列；
//! - 已耗尽或无法解码：发布到死信交换机；
//! - 上述副本确认后才确认原消息，发布失败则原消息重新入队。
//!
use chrono::Utc;
use eventbus_broker::{Channel, ConnectionPool, Delivery};
use eventbus_domain::{
    Event, EventBusConfig, EventEnvelope, EventListener, EventSerializer, Group,
    RetryBackoffConfiguration, RetryDecision,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::consumer::{self, ConsumerHandle, ListenerEntry, Subscribed};
use crate::error::BusResult;
use crate::publisher::Publisher;
use crate::topology::BusTopology;
use crate::{codec, headers};

/// 组内监听器顺序执行，一次只处理一条
const GROUP_CONSUMER_PREFETCH: u16 = 1;

type GroupListeners = Arc<RwLock<Vec<ListenerEntry>>>;

struct GroupState {
    listeners: GroupListeners,
    consumer: ConsumerHandle,
}

pub struct GroupRegistrations {
    topology: BusTopology,
    pool: ConnectionPool,
    serializer: Arc<dyn EventSerializer>,
    config: EventBusConfig,
    publisher: Arc<Publisher>,
    groups: Mutex<HashMap<Group, GroupState>>,
    next_id: AtomicU64,
}

impl GroupRegistrations {
    pub(crate) fn new(
        topology: BusTopology,
        pool: ConnectionPool,
        serializer: Arc<dyn EventSerializer>,
        config: EventBusConfig,
    ) -> Self {
        Self {
            topology,
            publisher: Arc::new(Publisher::new(pool.clone(), config.confirm_timeout())),
            pool,
            serializer,
            config,
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// 本实例处于 BOUND 状态的组
    pub async fn bound_groups(&self) -> Vec<Group> {
        self.groups.lock().await.keys().cloned().collect()
    }

    pub(crate) async fn register(
        &self,
        group: Group,
        listener: Arc<dyn EventListener>,
    ) -> BusResult<u64> {
        let mut groups = self.groups.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry { id, listener };

        if let Some(state) = groups.get(&group) {
            state
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry);
            debug!(group = %group, "listener added to bound group");
            return Ok(id);
        }

        let listeners: GroupListeners = Arc::new(RwLock::new(vec![entry]));
        let consumer = self.spawn_consumer(&group, listeners.clone()).await?;
        info!(group = %group, queue = %self.topology.naming().work_queue(&group), "group bound");
        groups.insert(
            group,
            GroupState {
                listeners,
                consumer,
            },
        );
        Ok(id)
    }

    /// 注销一个监听器；组内最后一个监听器注销时停止本地消费。
    /// 监听器可以在自己的 `event` 中注销所在的组。
    pub(crate) async fn unregister(&self, group: &Group, id: u64) {
        let removed = {
            let mut groups = self.groups.lock().await;
            let now_empty = match groups.get(group) {
                Some(state) => {
                    let mut listeners = state
                        .listeners
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    listeners.retain(|entry| entry.id != id);
                    listeners.is_empty()
                }
                None => return,
            };
            if now_empty { groups.remove(group) } else { None }
        };
        if let Some(state) = removed {
            state.consumer.stop().await;
            info!(group = %group, "group unbound");
        }
    }

    /// 连接重建后重新声明组拓扑并替换消费者；单个组失败不影响其他组
    pub(crate) async fn restore(&self) {
        let mut groups = self.groups.lock().await;
        for (group, state) in groups.iter_mut() {
            match self.spawn_consumer(group, state.listeners.clone()).await {
                Ok(consumer) => {
                    let previous = std::mem::replace(&mut state.consumer, consumer);
                    previous.shutdown();
                    info!(group = %group, "group consumer restarted");
                }
                Err(e) => error!(group = %group, error = %e, "failed to restore group consumer"),
            }
        }
    }

    pub(crate) async fn stop(&self) {
        let groups: Vec<(Group, GroupState)> = self.groups.lock().await.drain().collect();
        for (group, state) in groups {
            state.consumer.stop().await;
            debug!(group = %group, "group consumer stopped");
        }
        self.publisher.close().await;
    }

    /// 启动组的消费循环；每次（重新）订阅前都声明组拓扑，队列被删除后也能恢复
    async fn spawn_consumer(
        &self,
        group: &Group,
        listeners: GroupListeners,
    ) -> BusResult<ConsumerHandle> {
        let naming = self.topology.naming();
        let worker = Arc::new(GroupWorker {
            group: group.clone(),
            retry: self.config.retry_for(group),
            retry_exchange: naming.retry_exchange(group),
            retry_routing_key: self.topology.retry_routing_key(group).to_string(),
            dead_letter_exchange: naming.dead_letter_exchange(),
            serializer: self.serializer.clone(),
            publisher: self.publisher.clone(),
            listeners,
        });

        let queue = GroupQueue {
            pool: self.pool.clone(),
            topology: self.topology.clone(),
            queue: naming.work_queue(group),
            consumer_tag: format!("group-{group}"),
            group: group.clone(),
        };
        ConsumerHandle::start(
            format!("group:{group}"),
            *self.pool.config(),
            move || {
                let queue = queue.clone();
                async move { queue.subscribe().await }
            },
            move |channel, delivery| {
                let worker = worker.clone();
                async move { worker.handle(&*channel, delivery).await }
            },
        )
        .await
    }
}

/// 组工作队列的订阅
#[derive(Clone)]
struct GroupQueue {
    pool: ConnectionPool,
    topology: BusTopology,
    group: Group,
    queue: String,
    consumer_tag: String,
}

impl GroupQueue {
    async fn subscribe(&self) -> BusResult<Subscribed> {
        let channel = self.pool.channel().await?;
        self.topology.declare_group(&*channel, &self.group).await?;
        let stream = channel
            .consume(&self.queue, &self.consumer_tag, GROUP_CONSUMER_PREFETCH)
            .await?;
        Ok((channel, stream))
    }
}

/// 单个组的消费逻辑
struct GroupWorker {
    group: Group,
    retry: RetryBackoffConfiguration,
    retry_exchange: String,
    retry_routing_key: String,
    dead_letter_exchange: String,
    serializer: Arc<dyn EventSerializer>,
    publisher: Arc<Publisher>,
    listeners: GroupListeners,
}

impl GroupWorker {
    async fn handle(&self, channel: &dyn Channel, delivery: Delivery) {
        let envelope = match codec::decode(&*self.serializer, &delivery.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                // 解码失败不可恢复，不消耗重试次数
                error!(group = %self.group, error = %e, "undecodable message, dead-lettering");
                let reason = format!("undecodable message: {e}");
                let published = self.dead_letter(&delivery, &reason).await;
                self.settle(channel, delivery.delivery_tag, published).await;
                return;
            }
        };

        match self.run_listeners(envelope.event()).await {
            Ok(()) => {
                debug!(
                    group = %self.group,
                    event_id = %envelope.event().event_id(),
                    retry_count = envelope.retry_count(),
                    "event handled"
                );
                self.settle(channel, delivery.delivery_tag, Ok(())).await;
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let published = self.on_failure(&delivery, &envelope, &reason).await;
                self.settle(channel, delivery.delivery_tag, published).await;
            }
        }
    }

    /// 顺序执行本地监听器，遇到第一个失败即返回
    async fn run_listeners(&self, event: &Event) -> anyhow::Result<()> {
        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.listener.clone())
            .collect();

        for listener in listeners {
            if !listener.is_handling(event) {
                continue;
            }
            consumer::invoke(&*listener, event)
                .await
                .map_err(|e| e.context(format!("listener {}", listener.name())))?;
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        reason: &str,
    ) -> BusResult<()> {
        let event_id = envelope.event().event_id();
        match self.retry.decide(envelope.retry_count()) {
            RetryDecision::Retry {
                next_retry_count,
                delay,
            } => {
                warn!(
                    group = %self.group,
                    event_id = %event_id,
                    retry_count = next_retry_count,
                    ?delay,
                    error = reason,
                    "group listener failed, scheduling retry"
                );
                let message = delivery
                    .message
                    .clone()
                    .with_header(headers::RETRY_COUNT, next_retry_count)
                    .with_routing_key(self.retry_routing_key.clone())
                    .with_expiration(Some(delay));
                self.publisher.publish(&self.retry_exchange, message).await
            }
            RetryDecision::DeadLetter => {
                error!(
                    group = %self.group,
                    event_id = %event_id,
                    retry_count = envelope.retry_count(),
                    error = reason,
                    "retries exhausted, dead-lettering"
                );
                self.dead_letter(delivery, reason).await
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BusResult<()> {
        let message = delivery
            .message
            .clone()
            .with_expiration(None)
            .with_header(headers::DEAD_LETTER_GROUP, self.group.as_str())
            .with_header(headers::FAILURE_REASON, reason)
            .with_header(headers::DEAD_LETTERED_AT, Utc::now().to_rfc3339());
        self.publisher
            .publish(&self.dead_letter_exchange, message)
            .await
    }

    /// 副本发布成功才确认原消息，否则重新入队
    async fn settle(&self, channel: &dyn Channel, delivery_tag: u64, published: BusResult<()>) {
        let result = match published {
            Ok(()) => channel.ack(delivery_tag).await,
            Err(e) => {
                error!(
                    group = %self.group,
                    error = %e,
                    "failed to publish retry or dead-letter copy, requeueing"
                );
                channel.nack(delivery_tag, true).await
            }
        };
        if let Err(e) = result {
            debug!(group = %self.group, error = %e, "settle failed, message will be redelivered");
        }
    }
}
