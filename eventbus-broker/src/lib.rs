//! 消息中间件抽象（eventbus-broker）
//!
//! 以 AMQP 0-9-1 的语义描述总线所依赖的消息中间件能力：
//! - `Broker` → `Connection` → `Channel` 三层协议（`broker`）；
//! - 交换机/队列声明与消息模型（`topology`、`message`）；
//! - topic 路由匹配（`routing`）；
//! - 进程内实现 `InMemoryBroker`（`memory`），支持确认、TTL、死信交换机、
//!   独占/自动删除队列与连接断开；
//! - 连接池与断线重连（`pool`）：所有组件共享同一连接，各自持有独立的 channel。
//!
pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod pool;
pub mod routing;
pub mod topology;

pub use broker::{Broker, Channel, Connection, DeliveryStream};
pub use error::{BrokerError, BrokerResult};
pub use memory::InMemoryBroker;
pub use message::{Delivery, HeaderValue, Headers, Message};
pub use pool::{ConnectionPool, DeclareQueueOnReconnect, PoolConfig, ReconnectionHandler};
pub use topology::{ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec};
