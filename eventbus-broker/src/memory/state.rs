//! 进程内中间件的状态与路由规则
//!
//! 所有操作在同一把锁内同步完成；需要延迟执行的过期检查以 `Effects::timers`
//! 的形式交给外层调度。
//!
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::message::{Delivery, Message};
use crate::routing::topic_matches;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec};

/// 死信原因：`expired` 或 `rejected`
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// 消息被死信转发前所在的队列
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

const DEFAULT_EXCHANGE: &str = "";

#[derive(Default)]
pub(crate) struct Effects {
    touched: BTreeSet<String>,
    pub(crate) timers: Vec<(String, Instant)>,
}

struct ExchangeState {
    spec: ExchangeSpec,
    bindings: Vec<(String, String)>,
}

#[derive(Clone)]
struct Stored {
    message: Message,
    exchange: String,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ConsumerState {
    tag: String,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer_tag: Option<String>,
    stored: Stored,
}

struct ChannelEntry {
    connection: u64,
    token: CancellationToken,
}

#[derive(Default)]
pub(crate) struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, CancellationToken>,
    channels: HashMap<u64, ChannelEntry>,
    next_delivery_tag: u64,
}

impl BrokerState {
    // ---- 连接与 channel ----

    pub(crate) fn open_connection(&mut self, id: u64, token: CancellationToken) {
        self.connections.insert(id, token);
    }

    pub(crate) fn open_channel(&mut self, id: u64, connection: u64, token: CancellationToken) {
        self.channels.insert(id, ChannelEntry { connection, token });
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn connection_ids(&self) -> Vec<u64> {
        self.connections.keys().copied().collect()
    }

    pub(crate) fn close_channel(&mut self, channel: u64, fx: &mut Effects) {
        if let Some(entry) = self.channels.remove(&channel) {
            entry.token.cancel();
        }

        // 未确认的消息按原顺序放回队首
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(entry, fx);
            }
        }

        let affected: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.consumers.iter().any(|c| c.channel == channel))
            .map(|(name, _)| name.clone())
            .collect();
        for name in affected {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.consumers.retain(|c| c.channel != channel);
                queue.cursor = 0;
            }
            self.after_consumer_removed(&name, fx);
        }
    }

    pub(crate) fn close_connection(&mut self, connection: u64, fx: &mut Effects) {
        let Some(token) = self.connections.remove(&connection) else {
            return;
        };
        debug!(connection, "closing connection");

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, fx);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        token.cancel();
    }

    /// 整个中间件重启：断开所有连接，丢弃非持久化的交换机与队列
    pub(crate) fn restart(&mut self, fx: &mut Effects) {
        for connection in self.connection_ids() {
            self.close_connection(connection, fx);
        }
        let transient: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.spec.durable())
            .map(|(name, _)| name.clone())
            .collect();
        for name in transient {
            self.remove_queue(&name);
        }
        self.exchanges.retain(|_, e| e.spec.durable());
        self.unacked.clear();
    }

    // ---- 拓扑 ----

    pub(crate) fn declare_exchange(&mut self, spec: &ExchangeSpec) -> BrokerResult<()> {
        if spec.name().is_empty() {
            return Err(BrokerError::precondition("the default exchange cannot be declared"));
        }
        match self.exchanges.get(spec.name()) {
            Some(existing) if existing.spec != *spec => Err(BrokerError::precondition(format!(
                "exchange {} redeclared with different parameters",
                spec.name()
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    spec.name().to_string(),
                    ExchangeState {
                        spec: spec.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn exchange_exists(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub(crate) fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.exchanges.get(exchange).is_some_and(|e| {
            e.bindings
                .iter()
                .any(|(q, k)| q == queue && k == routing_key)
        })
    }

    pub(crate) fn declare_queue(
        &mut self,
        connection: u64,
        spec: &QueueSpec,
    ) -> BrokerResult<QueueInfo> {
        if let Some(existing) = self.queues.get(spec.name()) {
            check_owner(spec.name(), existing, connection)?;
            if existing.spec != *spec {
                return Err(BrokerError::precondition(format!(
                    "queue {} redeclared with different parameters",
                    spec.name()
                )));
            }
            return Ok(info(existing));
        }

        let queue = QueueState {
            spec: spec.clone(),
            owner: spec.exclusive().then_some(connection),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        };
        let result = info(&queue);
        self.queues.insert(spec.name().to_string(), queue);
        Ok(result)
    }

    pub(crate) fn queue_info(&self, connection: Option<u64>, name: &str) -> BrokerResult<QueueInfo> {
        let queue = self.queues.get(name).ok_or_else(|| not_found("queue", name))?;
        if let Some(connection) = connection {
            check_owner(name, queue, connection)?;
        }
        Ok(info(queue))
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn bind(
        &mut self,
        connection: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let state = self.queues.get(queue).ok_or_else(|| not_found("queue", queue))?;
        check_owner(queue, state, connection)?;
        let exchange_state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    pub(crate) fn unbind(&mut self, queue: &str, exchange: &str, routing_key: &str) {
        if let Some(exchange_state) = self.exchanges.get_mut(exchange) {
            exchange_state
                .bindings
                .retain(|(q, k)| !(q == queue && k == routing_key));
        }
    }

    pub(crate) fn delete_queue(&mut self, connection: u64, name: &str) -> BrokerResult<usize> {
        match self.queues.get(name) {
            Some(queue) => check_owner(name, queue, connection)?,
            None => return Ok(0),
        }
        Ok(self.remove_queue(name))
    }

    fn remove_queue(&mut self, name: &str) -> usize {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        debug!(queue = name, "queue deleted");
        queue.ready.len()
    }

    // ---- 发布与路由 ----

    pub(crate) fn publish(
        &mut self,
        exchange: &str,
        message: Message,
        fx: &mut Effects,
    ) -> BrokerResult<()> {
        let targets = self.route(exchange, message.routing_key())?;
        if targets.is_empty() {
            debug!(exchange, routing_key = message.routing_key(), "unroutable message dropped");
        }
        for queue in targets {
            let stored = Stored {
                message: message.clone(),
                exchange: exchange.to_string(),
                redelivered: false,
                expires_at: None,
            };
            self.enqueue(&queue, stored, fx);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &state.bindings {
            let matched = match state.spec.kind() {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, name: &str, mut stored: Stored, fx: &mut Effects) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        let ttl = match (stored.message.expiration(), queue.spec.message_ttl()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        stored.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        if let Some(at) = stored.expires_at {
            fx.timers.push((name.to_string(), at));
        }
        queue.ready.push_back(stored);
        fx.touched.insert(name.to_string());
    }

    fn requeue(&mut self, entry: Unacked, fx: &mut Effects) {
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            let mut stored = entry.stored;
            stored.redelivered = true;
            queue.ready.push_front(stored);
            fx.touched.insert(entry.queue);
        }
    }

    fn dead_letter(&mut self, queue: &str, stored: Stored, reason: &str, fx: &mut Effects) {
        let Some(spec) = self.queues.get(queue).map(|q| q.spec.clone()) else {
            return;
        };
        let Some(dlx) = spec.dead_letter_exchange() else {
            debug!(queue, reason, "message discarded, no dead-letter exchange");
            return;
        };
        let routing_key = spec
            .dead_letter_routing_key()
            .unwrap_or(stored.message.routing_key())
            .to_string();
        let message = stored
            .message
            .with_expiration(None)
            .with_routing_key(routing_key.clone())
            .with_header(DEATH_REASON_HEADER, reason)
            .with_header(DEATH_QUEUE_HEADER, queue);

        match self.route(dlx, &routing_key) {
            Ok(targets) => {
                for target in targets {
                    let stored = Stored {
                        message: message.clone(),
                        exchange: dlx.to_string(),
                        redelivered: false,
                        expires_at: None,
                    };
                    self.enqueue(&target, stored, fx);
                }
            }
            Err(e) => warn!(queue, dlx, error = %e, "dead-lettering failed, message dropped"),
        }
    }

    pub(crate) fn expire(&mut self, name: &str, fx: &mut Effects) {
        let now = Instant::now();
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        let (expired, kept): (Vec<Stored>, Vec<Stored>) =
            queue.ready.drain(..).partition(|s| s.is_expired(now));
        queue.ready = kept.into();
        for stored in expired {
            self.dead_letter(name, stored, "expired", fx);
        }
        fx.touched.insert(name.to_string());
    }

    // ---- 消费与确认 ----

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_consumer(
        &mut self,
        connection: u64,
        channel: u64,
        queue: &str,
        tag: &str,
        prefetch: u16,
        sender: mpsc::UnboundedSender<Delivery>,
        fx: &mut Effects,
    ) -> BrokerResult<()> {
        let state = self.queues.get_mut(queue).ok_or_else(|| not_found("queue", queue))?;
        check_owner(queue, state, connection)?;
        if state
            .consumers
            .iter()
            .any(|c| c.tag == tag && c.channel == channel)
        {
            return Err(BrokerError::precondition(format!(
                "consumer tag {tag} already in use"
            )));
        }
        state.consumers.push(ConsumerState {
            tag: tag.to_string(),
            channel,
            prefetch,
            in_flight: 0,
            sender,
        });
        fx.touched.insert(queue.to_string());
        Ok(())
    }

    pub(crate) fn cancel_consumer(&mut self, channel: u64, tag: &str, fx: &mut Effects) {
        let found = self
            .queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == tag && c.channel == channel))
            .map(|(name, _)| name.clone());
        if let Some(name) = found {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue
                    .consumers
                    .retain(|c| !(c.tag == tag && c.channel == channel));
                queue.cursor = 0;
            }
            self.after_consumer_removed(&name, fx);
        }
    }

    pub(crate) fn cancel_queue_consumers(&mut self, name: &str, fx: &mut Effects) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        // 丢弃发送端即结束消费流；未确认的消息留在 channel 上直到其关闭
        queue.consumers.clear();
        queue.cursor = 0;
        self.after_consumer_removed(name, fx);
    }

    fn after_consumer_removed(&mut self, name: &str, fx: &mut Effects) {
        let delete = self
            .queues
            .get(name)
            .is_some_and(|q| q.consumers.is_empty() && q.spec.auto_delete());
        if delete {
            self.remove_queue(name);
        } else {
            fx.touched.insert(name.to_string());
        }
    }

    pub(crate) fn get(
        &mut self,
        connection: u64,
        channel: u64,
        name: &str,
        fx: &mut Effects,
    ) -> BrokerResult<Option<Delivery>> {
        let state = self.queues.get(name).ok_or_else(|| not_found("queue", name))?;
        check_owner(name, state, connection)?;

        loop {
            let now = Instant::now();
            let Some(stored) = self.queues.get_mut(name).and_then(|q| q.ready.pop_front()) else {
                return Ok(None);
            };
            if stored.is_expired(now) {
                self.dead_letter(name, stored, "expired", fx);
                continue;
            }
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                consumer_tag: None,
                exchange: stored.exchange.clone(),
                redelivered: stored.redelivered,
                message: stored.message.clone(),
            };
            self.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    channel,
                    consumer_tag: None,
                    stored,
                },
            );
            return Ok(Some(delivery));
        }
    }

    pub(crate) fn ack(&mut self, channel: u64, tag: u64, fx: &mut Effects) -> BrokerResult<()> {
        let entry = self.take_unacked(channel, tag)?;
        self.release_slot(&entry, fx);
        Ok(())
    }

    pub(crate) fn nack(
        &mut self,
        channel: u64,
        tag: u64,
        requeue: bool,
        fx: &mut Effects,
    ) -> BrokerResult<()> {
        let entry = self.take_unacked(channel, tag)?;
        self.release_slot(&entry, fx);
        if requeue {
            self.requeue(entry, fx);
        } else {
            self.dead_letter(&entry.queue, entry.stored, "rejected", fx);
        }
        Ok(())
    }

    fn take_unacked(&mut self, channel: u64, tag: u64) -> BrokerResult<Unacked> {
        match self.unacked.get(&tag) {
            Some(entry) if entry.channel == channel => {}
            _ => {
                return Err(BrokerError::precondition(format!(
                    "unknown delivery tag {tag}"
                )));
            }
        }
        self.unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::precondition(format!("unknown delivery tag {tag}")))
    }

    fn release_slot(&mut self, entry: &Unacked, fx: &mut Effects) {
        let Some(consumer_tag) = entry.consumer_tag.as_deref() else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == consumer_tag && c.channel == entry.channel)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            fx.touched.insert(entry.queue.clone());
        }
    }

    /// 依次推进受影响的队列，直到不再产生新的投递
    pub(crate) fn settle(&mut self, fx: &mut Effects) {
        while let Some(name) = fx.touched.pop_first() {
            self.pump(&name, fx);
        }
    }

    fn pump(&mut self, name: &str, fx: &mut Effects) {
        loop {
            let now = Instant::now();
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }
            if queue.ready.front().is_some_and(|s| s.is_expired(now)) {
                if let Some(stored) = queue.ready.pop_front() {
                    self.dead_letter(name, stored, "expired", fx);
                }
                continue;
            }

            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            let Some(stored) = queue.ready.pop_front() else {
                return;
            };
            queue.cursor = (index + 1) % count;

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let consumer = &mut queue.consumers[index];
            let delivery = Delivery {
                delivery_tag: tag,
                consumer_tag: Some(consumer.tag.clone()),
                exchange: stored.exchange.clone(),
                redelivered: stored.redelivered,
                message: stored.message.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                // 接收端已被丢弃，视为消费者取消
                queue.consumers.remove(index);
                queue.cursor = 0;
                queue.ready.push_front(stored);
                self.after_consumer_removed(name, fx);
                continue;
            }

            consumer.in_flight += 1;
            let channel = consumer.channel;
            let consumer_tag = consumer.tag.clone();
            self.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    channel,
                    consumer_tag: Some(consumer_tag),
                    stored,
                },
            );
        }
    }
}

fn info(queue: &QueueState) -> QueueInfo {
    QueueInfo {
        messages: queue.ready.len(),
        consumers: queue.consumers.len(),
    }
}

fn check_owner(name: &str, queue: &QueueState, connection: u64) -> BrokerResult<()> {
    match queue.owner {
        Some(owner) if owner != connection => Err(BrokerError::ResourceLocked {
            queue: name.to_string(),
        }),
        _ => Ok(()),
    }
}

fn not_found(kind: &'static str, name: &str) -> BrokerError {
    BrokerError::NotFound {
        kind,
        name: name.to_string(),
    }
}
