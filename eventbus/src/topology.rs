//! 总线拓扑
//!
//! 由 `NamingStrategy` 推导出每个资源的声明参数：
//!
//! | 资源 | 类型 |
//! |---|---|
//! | 主交换机 | topic，持久化 |
//! | 死信交换机 / 死信队列 | fanout / 持久化队列 |
//! | 实例队列 | 非持久化、独占、自动删除 |
//! | 组工作队列 | 持久化，以 `#` 绑定主交换机 |
//! | 组重试交换机 | direct，持久化 |
//! | 组重试队列 | 持久化，消息过期后经默认交换机转入工作队列 |
//!
use eventbus_broker::{BrokerResult, Channel, ExchangeKind, ExchangeSpec, QueueSpec};
use eventbus_domain::{EventBusId, Group, NamingStrategy};
use tracing::debug;

/// 死信交换机为 fanout，绑定键无意义
const DEAD_LETTER_BINDING_KEY: &str = "";
/// 默认交换机：按路由键直达同名队列
pub(crate) const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
pub struct BusTopology {
    naming: NamingStrategy,
}

impl BusTopology {
    pub fn new(naming: NamingStrategy) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> &NamingStrategy {
        &self.naming
    }

    pub fn main_exchange(&self) -> ExchangeSpec {
        ExchangeSpec::builder()
            .name(self.naming.exchange())
            .kind(ExchangeKind::Topic)
            .build()
    }

    pub fn dead_letter_exchange(&self) -> ExchangeSpec {
        ExchangeSpec::builder()
            .name(self.naming.dead_letter_exchange())
            .kind(ExchangeKind::Fanout)
            .build()
    }

    pub fn dead_letter_queue(&self) -> QueueSpec {
        QueueSpec::builder()
            .name(self.naming.dead_letter_queue())
            .build()
    }

    pub fn instance_queue(&self, id: &EventBusId) -> QueueSpec {
        QueueSpec::builder()
            .name(self.naming.event_bus_queue(id))
            .durable(false)
            .exclusive(true)
            .auto_delete(true)
            .build()
    }

    pub fn work_queue(&self, group: &Group) -> QueueSpec {
        QueueSpec::builder()
            .name(self.naming.work_queue(group))
            .build()
    }

    pub fn retry_exchange(&self, group: &Group) -> ExchangeSpec {
        ExchangeSpec::builder()
            .name(self.naming.retry_exchange(group))
            .kind(ExchangeKind::Direct)
            .build()
    }

    pub fn retry_queue(&self, group: &Group) -> QueueSpec {
        QueueSpec::builder()
            .name(self.naming.retry_queue(group))
            .dead_letter_exchange(DEFAULT_EXCHANGE)
            .dead_letter_routing_key(self.naming.work_queue(group))
            .build()
    }

    /// 重试交换机上的路由键（同时用作重试队列的绑定键）
    pub fn retry_routing_key<'a>(&self, group: &'a Group) -> &'a str {
        group.as_str()
    }

    /// 所有实例共享的资源：主交换机与死信交换机/队列
    pub async fn declare_common(&self, channel: &dyn Channel) -> BrokerResult<()> {
        let dead_letter_exchange = self.dead_letter_exchange();
        let dead_letter_queue = self.dead_letter_queue();

        channel.declare_exchange(&self.main_exchange()).await?;
        channel.declare_exchange(&dead_letter_exchange).await?;
        channel.declare_queue(&dead_letter_queue).await?;
        channel
            .bind_queue(
                dead_letter_queue.name(),
                dead_letter_exchange.name(),
                DEAD_LETTER_BINDING_KEY,
            )
            .await?;
        debug!(prefix = self.naming.prefix(), "common topology declared");
        Ok(())
    }

    /// 组的重试交换机/队列与工作队列；重复声明为空操作
    pub async fn declare_group(&self, channel: &dyn Channel, group: &Group) -> BrokerResult<()> {
        let retry_exchange = self.retry_exchange(group);
        let retry_queue = self.retry_queue(group);
        let work_queue = self.work_queue(group);

        channel.declare_exchange(&retry_exchange).await?;
        channel.declare_queue(&retry_queue).await?;
        channel
            .bind_queue(
                retry_queue.name(),
                retry_exchange.name(),
                self.retry_routing_key(group),
            )
            .await?;
        channel.declare_queue(&work_queue).await?;
        channel
            .bind_queue(
                work_queue.name(),
                &self.naming.exchange(),
                group.binding_key(),
            )
            .await?;
        debug!(group = %group, queue = work_queue.name(), "group topology declared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topology() -> BusTopology {
        BusTopology::new(NamingStrategy::new("james").unwrap())
    }

    #[test]
    fn retry_queue_dead_letters_into_work_queue() {
        let group = Group::new("mailbox-index").unwrap();
        let spec = topology().retry_queue(&group);

        assert_eq!(spec.name(), "james-retryQueue-mailbox-index");
        assert!(spec.durable());
        assert_eq!(spec.dead_letter_exchange(), Some(""));
        assert_eq!(
            spec.dead_letter_routing_key(),
            Some("james-workQueue-mailbox-index")
        );
        assert_eq!(spec.message_ttl(), None::<Duration>);
    }

    #[test]
    fn instance_queue_is_private() {
        let id = EventBusId::random();
        let spec = topology().instance_queue(&id);

        assert_eq!(spec.name(), format!("james-eventbus-{id}"));
        assert!(!spec.durable());
        assert!(spec.exclusive());
        assert!(spec.auto_delete());
    }

    #[test]
    fn exchange_kinds() {
        let topology = topology();
        let group = Group::new("g").unwrap();

        assert_eq!(topology.main_exchange().kind(), ExchangeKind::Topic);
        assert_eq!(topology.dead_letter_exchange().kind(), ExchangeKind::Fanout);
        assert_eq!(topology.retry_exchange(&group).kind(), ExchangeKind::Direct);
        assert_eq!(topology.main_exchange().name(), "james-exchange");
    }
}
