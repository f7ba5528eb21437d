//! 资源命名约定（NamingStrategy）
//!
//! 由部署前缀与实例标识/组名推导出消息中间件资源名，是拓扑的唯一来源。
//! 纯函数、无状态：任意实例对同一组计算出的名称都相同，这是竞争消费成立的前提。
//!
//! | 资源 | 名称 |
//! |---|---|
//! | 主交换机 | `{prefix}-exchange` |
//! | 死信交换机 | `{prefix}-dead-letter-exchange` |
//! | 死信队列 | `{prefix}-dead-letter-queue` |
//! | 实例注册队列 | `{prefix}-eventbus-{eventBusId}` |
//! | 组工作队列 | `{prefix}-workQueue-{group}` |
//! | 组重试交换机 | `{prefix}-retryExchange-{group}` |
//! | 组重试队列 | `{prefix}-retryQueue-{group}` |
//!
use crate::error::{DomainError, DomainResult};
use crate::event_bus_id::EventBusId;
use crate::group::Group;

pub const DEFAULT_PREFIX: &str = "mailboxEvent";

const MAX_PREFIX_LEN: usize = 40;

const EXCHANGE: &str = "exchange";
const DEAD_LETTER_EXCHANGE: &str = "dead-letter-exchange";
const DEAD_LETTER_QUEUE: &str = "dead-letter-queue";
const EVENT_BUS_QUEUE: &str = "eventbus";
const WORK_QUEUE: &str = "workQueue";
const RETRY_EXCHANGE: &str = "retryExchange";
const RETRY_QUEUE: &str = "retryQueue";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamingStrategy {
    prefix: String,
}

impl NamingStrategy {
    pub fn new(prefix: impl Into<String>) -> DomainResult<Self> {
        let prefix = prefix.into();
        let invalid = |reason: &str| DomainError::InvalidPrefix {
            prefix: prefix.clone(),
            reason: reason.to_string(),
        };

        if prefix.is_empty() {
            return Err(invalid("prefix must not be empty"));
        }
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(invalid("prefix is too long"));
        }
        if prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("prefix must not contain whitespace or control characters"));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn exchange(&self) -> String {
        self.name(EXCHANGE)
    }

    pub fn dead_letter_exchange(&self) -> String {
        self.name(DEAD_LETTER_EXCHANGE)
    }

    pub fn dead_letter_queue(&self) -> String {
        self.name(DEAD_LETTER_QUEUE)
    }

    /// 实例私有队列，仅由实例标识决定
    pub fn event_bus_queue(&self, id: &EventBusId) -> String {
        self.scoped(EVENT_BUS_QUEUE, &id.to_string())
    }

    /// 组工作队列，只依赖前缀与组名，与实例无关
    pub fn work_queue(&self, group: &Group) -> String {
        self.scoped(WORK_QUEUE, group.as_str())
    }

    pub fn retry_exchange(&self, group: &Group) -> String {
        self.scoped(RETRY_EXCHANGE, group.as_str())
    }

    pub fn retry_queue(&self, group: &Group) -> String {
        self.scoped(RETRY_QUEUE, group.as_str())
    }

    fn name(&self, category: &str) -> String {
        format!("{}-{}", self.prefix, category)
    }

    fn scoped(&self, category: &str, suffix: &str) -> String {
        format!("{}-{}-{}", self.prefix, category, suffix)
    }
}

impl Default for NamingStrategy {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn naming() -> NamingStrategy {
        NamingStrategy::new("james").unwrap()
    }

    #[test]
    fn global_resources_follow_prefix() {
        let naming = naming();
        assert_eq!(naming.exchange(), "james-exchange");
        assert_eq!(naming.dead_letter_exchange(), "james-dead-letter-exchange");
        assert_eq!(naming.dead_letter_queue(), "james-dead-letter-queue");
    }

    #[test]
    fn group_resources_are_instance_independent() {
        let group = Group::new("mailbox-index").unwrap();
        let a = NamingStrategy::new("james").unwrap();
        let b = NamingStrategy::new(String::from("james")).unwrap();

        assert_eq!(a.work_queue(&group), "james-workQueue-mailbox-index");
        assert_eq!(a.work_queue(&group), b.work_queue(&group));
        assert_eq!(a.retry_exchange(&group), "james-retryExchange-mailbox-index");
        assert_eq!(a.retry_queue(&group), "james-retryQueue-mailbox-index");
    }

    #[test]
    fn instance_queues_are_unique() {
        let naming = naming();
        let names: HashSet<String> = (0..1000)
            .map(|_| naming.event_bus_queue(&EventBusId::random()))
            .collect();
        assert_eq!(names.len(), 1000);
        assert!(names.iter().all(|n| n.starts_with("james-eventbus-")));
    }

    #[test]
    fn distinct_groups_never_collide() {
        let naming = naming();
        let groups = ["a", "a-b", "a-b-c", "b", "workQueue-a", "retryQueue-a"];
        let names: HashSet<String> = groups
            .iter()
            .map(|g| naming.work_queue(&Group::new(*g).unwrap()))
            .collect();
        assert_eq!(names.len(), groups.len());
    }

    #[test]
    fn rejects_invalid_prefix() {
        assert!(NamingStrategy::new("").is_err());
        assert!(NamingStrategy::new("with space").is_err());
        assert_eq!(NamingStrategy::default().prefix(), DEFAULT_PREFIX);
    }
}
