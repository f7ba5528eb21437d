//! 消息中间件错误
//!
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel closed")]
    ChannelClosed,
    #[error("broker unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("not found: {kind}={name}")]
    NotFound { kind: &'static str, name: String },
    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },
    #[error("resource locked: queue={queue} is exclusive to another connection")]
    ResourceLocked { queue: String },
    #[error("connection pool is shut down")]
    PoolShutdown,
}

impl BrokerError {
    /// 连接或 channel 已失效，换一个 channel 后可以重试
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionClosed | BrokerError::ChannelClosed | BrokerError::Unavailable { .. }
        )
    }

    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        BrokerError::PreconditionFailed {
            reason: reason.into(),
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
