//! 消息与投递
//!
use bon::Builder;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// 发布到交换机的消息
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Message {
    #[builder(into)]
    routing_key: String,
    #[builder(into, default)]
    body: Vec<u8>,
    #[builder(default)]
    headers: Headers,
    #[builder(into)]
    message_id: Option<String>,
    /// 单条消息的存活时间，过期后按队列的死信配置转发
    expiration: Option<Duration>,
}

impl Message {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn header_int(&self, name: &str) -> Option<i64> {
        match self.headers.get(name) {
            Some(HeaderValue::Int(v)) => Some(*v),
            Some(HeaderValue::Str(s)) => s.parse().ok(),
            None => None,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.headers.get(name) {
            Some(HeaderValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }
}

/// 投递给消费者的消息；须通过 `Channel::ack`/`Channel::nack` 确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: Option<String>,
    pub exchange: String,
    pub redelivered: bool,
    pub message: Message,
}
