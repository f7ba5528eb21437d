//! 分布式事件总线领域层（eventbus-domain）
//!
//! 提供事件总线在领域层的通用构件，不绑定任何具体的消息中间件：
//! - 事件与实例标识（`event`、`event_bus_id`）
//! - 消费组与路由键（`group`、`registration_key`）
//! - 资源命名约定（`naming`）：由部署前缀与标识推导出交换机/队列名称
//! - 监听器协议（`listener`）与事件序列化（`serializer`）
//! - 重试退避配置（`retry`）与总线配置加载（`config`）
//!
//! 运行时（投递、注册、重试/死信）由 `eventbus` crate 基于 `eventbus-broker`
//! 的消息中间件抽象实现。
//!
pub mod config;
pub mod error;
pub mod event;
pub mod event_bus_id;
pub mod group;
pub mod listener;
pub mod naming;
pub mod registration_key;
pub mod retry;
pub mod serializer;

pub use config::{EventBusConfig, ReconnectConfiguration};
pub use error::{DomainError, DomainResult};
pub use event::{Event, EventEnvelope, EventId};
pub use event_bus_id::EventBusId;
pub use group::Group;
pub use listener::EventListener;
pub use naming::NamingStrategy;
pub use registration_key::RegistrationKey;
pub use retry::{RetryBackoffConfiguration, RetryDecision};
pub use serializer::{EventSerializer, JsonEventSerializer};
