//! 路由键注册（RegistrationKey）
//!
//! 键注册使用的路由键模式，语法与 AMQP topic 交换机一致：
//! 以 `.` 分隔的单词，`*` 匹配恰好一个单词，`#` 匹配零个或多个单词。
//!
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// AMQP 短字符串上限
pub const MAX_REGISTRATION_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistrationKey(String);

impl RegistrationKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 是否包含通配符
    pub fn is_pattern(&self) -> bool {
        self.0.split('.').any(|w| w == "*" || w == "#")
    }
}

fn validate(key: &str) -> DomainResult<()> {
    let invalid = |reason: &str| DomainError::InvalidRegistrationKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("registration key must not be empty"));
    }
    if key.len() > MAX_REGISTRATION_KEY_LEN {
        return Err(invalid("registration key is too long"));
    }
    for word in key.split('.') {
        if word.is_empty() {
            return Err(invalid("empty word"));
        }
        if word.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("whitespace or control character"));
        }
        if word.len() > 1 && (word.contains('*') || word.contains('#')) {
            return Err(invalid("wildcards must span a whole word"));
        }
    }
    Ok(())
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RegistrationKey {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for RegistrationKey {
    type Error = DomainError;

    fn try_from(value: String) -> DomainResult<Self> {
        Self::new(value)
    }
}

impl From<RegistrationKey> for String {
    fn from(key: RegistrationKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_topic_syntax() {
        assert!(RegistrationKey::new("mailbox.42").is_ok());
        assert!(RegistrationKey::new("mailbox.*").unwrap().is_pattern());
        assert!(RegistrationKey::new("#").unwrap().is_pattern());
        assert!(!RegistrationKey::new("mailbox.42").unwrap().is_pattern());

        assert!(RegistrationKey::new("").is_err());
        assert!(RegistrationKey::new("a..b").is_err());
        assert!(RegistrationKey::new("mail*").is_err());
        assert!(RegistrationKey::new("a b").is_err());
    }
}
