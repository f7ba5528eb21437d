//! 事件（Event）与传输信封（EventEnvelope）
//!
//! 事件由路由键、不透明的载荷与唯一 ID 组成，发布后不可变。
//! 信封在事件之外附带重试次数，是在消息中间件上传输的逻辑记录。
//!
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// 事件唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// 领域事件：路由键决定哪些绑定会收到该事件
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Event {
    #[builder(default = EventId::random())]
    event_id: EventId,
    #[builder(into)]
    routing_key: String,
    #[builder(into, default)]
    payload: Vec<u8>,
}

impl Event {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::random(),
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// 传输信封：事件 + 当前重试次数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    event: Event,
    retry_count: u32,
}

impl EventEnvelope {
    /// 首次投递的信封（重试次数为 0）
    pub fn new(event: Event) -> Self {
        Self {
            event,
            retry_count: 0,
        }
    }

    pub fn with_retry_count(event: Event, retry_count: u32) -> Self {
        Self { event, retry_count }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 下一次重试使用的信封
    pub fn next_attempt(&self) -> Self {
        Self {
            event: self.event.clone(),
            retry_count: self.retry_count.saturating_add(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_distinct_ids() {
        let a = Event::builder().routing_key("mailbox.added").build();
        let b = Event::builder().routing_key("mailbox.added").build();
        assert_ne!(a.event_id(), b.event_id());
        assert!(a.payload().is_empty());
    }

    #[test]
    fn envelope_counts_attempts() {
        let envelope = EventEnvelope::new(Event::new("k", "payload"));
        assert_eq!(envelope.retry_count(), 0);

        let next = envelope.next_attempt().next_attempt();
        assert_eq!(next.retry_count(), 2);
        assert_eq!(next.event(), envelope.event());
    }

    #[test]
    fn event_id_parses_its_display_form() {
        let id = EventId::random();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }
}
