//! 拓扑声明：交换机与队列
//!
//! 声明是幂等的：以相同参数重复声明为空操作，参数不一致则报错。
//!
use bon::Builder;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// 绑定键与路由键完全相等
    Direct,
    /// 投递到所有绑定队列
    Fanout,
    /// `*`/`#` 通配匹配
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ExchangeSpec {
    #[builder(into)]
    name: String,
    kind: ExchangeKind,
    #[builder(default = true)]
    durable: bool,
}

impl ExchangeSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn durable(&self) -> bool {
        self.durable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct QueueSpec {
    #[builder(into)]
    name: String,
    #[builder(default = true)]
    durable: bool,
    /// 仅声明它的连接可用，连接关闭时删除
    #[builder(default)]
    exclusive: bool,
    /// 最后一个消费者取消后删除
    #[builder(default)]
    auto_delete: bool,
    #[builder(into)]
    dead_letter_exchange: Option<String>,
    #[builder(into)]
    dead_letter_routing_key: Option<String>,
    message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl
    }
}

/// 被动声明返回的队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    /// 就绪（未投递）的消息数
    pub messages: usize,
    pub consumers: usize,
}
