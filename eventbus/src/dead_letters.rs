//! 死信查看与人工重投（EventDeadLetters）
//!
//! 死信队列为全局共享。总线从不自动重放死信：`redeliver` 把事件（重试次数
//! 归零）直接投回来源组的工作队列，只影响该组。
//!
use chrono::{DateTime, Utc};
use eventbus_broker::{BrokerError, ConnectionPool, Message};
use eventbus_domain::{Event, EventEnvelope, EventSerializer, Group};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::channel::ChannelSlot;
use crate::error::{BusError, BusResult};
use crate::publisher::Publisher;
use crate::topology::{BusTopology, DEFAULT_EXCHANGE};
use crate::{codec, headers};

/// 从死信队列取出的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// 无法解码时为 `None`，原始消息体见 `body`
    event: Option<Event>,
    body: Vec<u8>,
    group: Option<Group>,
    retry_count: u32,
    reason: Option<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn dead_lettered_at(&self) -> Option<DateTime<Utc>> {
        self.dead_lettered_at
    }

    fn decode(serializer: &dyn EventSerializer, message: &Message) -> Self {
        Self {
            event: serializer.from_bytes(message.body()).ok(),
            body: message.body().to_vec(),
            group: message
                .header_str(headers::DEAD_LETTER_GROUP)
                .and_then(|group| Group::new(group).ok()),
            retry_count: codec::retry_count(message),
            reason: message
                .header_str(headers::FAILURE_REASON)
                .map(str::to_string),
            dead_lettered_at: message
                .header_str(headers::DEAD_LETTERED_AT)
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .map(|at| at.with_timezone(&Utc)),
        }
    }
}

pub struct EventDeadLetters {
    queue: String,
    topology: BusTopology,
    serializer: Arc<dyn EventSerializer>,
    slot: ChannelSlot,
    publisher: Publisher,
}

impl EventDeadLetters {
    pub(crate) fn new(
        topology: BusTopology,
        pool: ConnectionPool,
        serializer: Arc<dyn EventSerializer>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            queue: topology.naming().dead_letter_queue(),
            topology,
            serializer,
            slot: ChannelSlot::new(pool.clone()),
            publisher: Publisher::new(pool, confirm_timeout),
        }
    }

    /// 死信队列中的消息数；队列尚未声明时为 0
    pub async fn count(&self) -> BusResult<usize> {
        let queue = self.queue.as_str();
        match self
            .slot
            .run(|channel| async move { channel.queue_info(queue).await })
            .await
        {
            Ok(info) => Ok(info.messages),
            Err(BrokerError::NotFound { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// 取出（并从队列中移除）一条死信
    pub async fn fetch(&self) -> BusResult<Option<DeadLetter>> {
        let channel = self.slot.get().await?;
        let Some(delivery) = channel.get(&self.queue).await? else {
            return Ok(None);
        };
        let dead_letter = DeadLetter::decode(&*self.serializer, &delivery.message);
        channel.ack(delivery.delivery_tag).await?;
        Ok(Some(dead_letter))
    }

    /// 把死信投回来源组的工作队列，重试次数归零
    pub async fn redeliver(&self, dead_letter: &DeadLetter) -> BusResult<()> {
        let event = dead_letter
            .event()
            .ok_or_else(|| BusError::NotRedeliverable {
                reason: "event body cannot be decoded".to_string(),
            })?;
        let group = dead_letter
            .group()
            .ok_or_else(|| BusError::NotRedeliverable {
                reason: "originating group is unknown".to_string(),
            })?;

        let message = codec::encode(&*self.serializer, &EventEnvelope::new(event.clone()))?
            .with_routing_key(self.topology.naming().work_queue(group));
        self.publisher.publish(DEFAULT_EXCHANGE, message).await?;
        info!(group = %group, event_id = %event.event_id(), "dead letter redelivered");
        Ok(())
    }

    pub(crate) async fn close(&self) {
        self.slot.close().await;
        self.publisher.close().await;
    }
}
