//! 消费组（Group）
//!
//! 一组相互竞争消费的监听器的名称。集群中注册到同一组的所有实例共享
//! 同一个持久化工作队列，因此组名必须在构造时校验，保证推导出的资源名合法。
//!
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// 组名在资源名中作为后缀使用，需为前缀与类别留出空间（队列名上限 255 字节）
pub const MAX_GROUP_NAME_LEN: usize = 200;

/// 组队列绑定到主交换机时使用的绑定键：组接收全部事件
pub const GROUP_BINDING_KEY: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Group(String);

impl Group {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 组工作队列在主交换机上的绑定键
    pub fn binding_key(&self) -> &'static str {
        GROUP_BINDING_KEY
    }
}

fn validate(name: &str) -> DomainResult<()> {
    let invalid = |reason: &str| DomainError::InvalidGroup {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("group name must not be empty"));
    }
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(invalid("group name is too long"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("group name must not contain whitespace or control characters"));
    }
    Ok(())
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Group {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Group {
    type Error = DomainError;

    fn try_from(value: String) -> DomainResult<Self> {
        Self::new(value)
    }
}

impl From<Group> for String {
    fn from(group: Group) -> Self {
        group.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hyphenated_and_dotted_names() {
        assert!(Group::new("mailbox-index").is_ok());
        assert!(Group::new("org.apache.james.QuotaUpdaterGroup").is_ok());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Group::new("").is_err());
        assert!(Group::new("with space").is_err());
        assert!(Group::new("tab\tname").is_err());
        assert!(Group::new("x".repeat(MAX_GROUP_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: Group = serde_json::from_str("\"mailbox-index\"").unwrap();
        assert_eq!(ok.as_str(), "mailbox-index");
        assert!(serde_json::from_str::<Group>("\"\"").is_err());
    }
}
