//! 总线运行时错误
//!
use eventbus_broker::BrokerError;
use eventbus_domain::DomainError;
use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("event bus is not started")]
    NotStarted,
    #[error("publisher confirm timed out after {timeout:?}")]
    ConfirmTimeout { timeout: Duration },
    #[error("dead letter cannot be redelivered: {reason}")]
    NotRedeliverable { reason: String },
}

pub type BusResult<T> = Result<T, BusError>;
