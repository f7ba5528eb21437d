//! 分布式事件总线运行时（eventbus）
//!
//! 在 `eventbus-broker` 的消息中间件抽象之上实现投递引擎：
//! - `dispatcher`：序列化事件并发布到主交换机，等待发布确认；
//! - `key_registration`：实例私有队列 + 路由键绑定，扇出到本实例监听器；
//! - `group_registration`：每组一个持久化工作队列，多实例竞争消费，
//!   失败时经重试交换机/队列按指数退避重投，耗尽后进入死信队列；
//! - `dead_letters`：死信队列的查看与人工重投；
//! - `reconnection`：连接重建后恢复拓扑与消费者；
//! - `distributed`：生命周期与对外接口 `DistributedEventBus`。
//!
mod channel;
mod codec;
mod consumer;
mod publisher;
mod reconnection;

pub mod dead_letters;
pub mod dispatcher;
pub mod distributed;
pub mod error;
pub mod group_registration;
pub mod headers;
pub mod key_registration;
pub mod registration;
pub mod topology;

pub use dead_letters::{DeadLetter, EventDeadLetters};
pub use distributed::DistributedEventBus;
pub use error::{BusError, BusResult};
pub use registration::{GroupRegistration, KeyRegistration, Registration, Subscription};
pub use topology::BusTopology;

pub use eventbus_broker as broker;
pub use eventbus_domain as domain;
