//! 领域层统一错误定义
//!
//! 聚焦序列化、标识校验与配置校验的最小必要集合，运行时在此基础上
//! 叠加消息中间件相关的错误。
//!
use thiserror::Error;

/// 统一错误类型（领域层最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },

    // --- 标识校验 ---
    #[error("invalid group: name={name}, reason={reason}")]
    InvalidGroup { name: String, reason: String },
    #[error("invalid registration key: key={key}, reason={reason}")]
    InvalidRegistrationKey { key: String, reason: String },
    #[error("invalid prefix: prefix={prefix}, reason={reason}")]
    InvalidPrefix { prefix: String, reason: String },

    // --- 配置 ---
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    #[error("configuration file error: {source}")]
    ConfigFile {
        #[from]
        source: toml::de::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl DomainError {
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        DomainError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        DomainError::Parse {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<base64::DecodeError> for DomainError {
    fn from(err: base64::DecodeError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}
