//! 总线配置（EventBusConfig）
//!
//! 配置面：消息中间件地址、资源前缀、默认与按组的重试配置、发布确认超时、
//! 重连退避。可通过 builder 构造，也可从 TOML 加载（时长以毫秒表示）：
//!
//! ```toml
//! uris = ["amqp://localhost:5672"]
//! prefix = "james"
//! confirm_timeout_ms = 10000
//!
//! [retry]
//! max_retries = 3
//! first_backoff_ms = 100
//!
//! [groups.mailbox-index]
//! max_retries = 2
//!
//! [reconnect]
//! min_delay_ms = 100
//! max_delay_ms = 5000
//! ```
//!
//! 配置错误（非法组名、非法重试参数等）在加载/校验时立即失败。
//!
use bon::Builder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::{DomainError, DomainResult};
use crate::group::Group;
use crate::naming::{DEFAULT_PREFIX, NamingStrategy};
use crate::retry::RetryBackoffConfiguration;

pub const DEFAULT_URI: &str = "amqp://localhost:5672";
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_MIN_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// 连接断开后重新建立连接的退避区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct ReconnectConfiguration {
    #[builder(default = DEFAULT_RECONNECT_MIN_DELAY)]
    min_delay: Duration,
    #[builder(default = DEFAULT_RECONNECT_MAX_DELAY)]
    max_delay: Duration,
}

impl Default for ReconnectConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfiguration {
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

#[derive(Debug, Clone, Builder)]
pub struct EventBusConfig {
    /// 网络中间件适配器要连接的地址，按顺序尝试；`InMemoryBroker` 不读取此项
    #[builder(default = vec![DEFAULT_URI.to_string()])]
    uris: Vec<String>,
    #[builder(into, default = DEFAULT_PREFIX.to_string())]
    prefix: String,
    #[builder(default = DEFAULT_CONFIRM_TIMEOUT)]
    confirm_timeout: Duration,
    #[builder(default)]
    retry: RetryBackoffConfiguration,
    #[builder(default)]
    group_retries: HashMap<Group, RetryBackoffConfiguration>,
    #[builder(default)]
    reconnect: ReconnectConfiguration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EventBusConfig {
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    pub fn default_retry(&self) -> &RetryBackoffConfiguration {
        &self.retry
    }

    pub fn reconnect(&self) -> &ReconnectConfiguration {
        &self.reconnect
    }

    /// 组的重试配置：优先使用按组覆盖，否则使用默认值
    pub fn retry_for(&self, group: &Group) -> RetryBackoffConfiguration {
        self.group_retries.get(group).copied().unwrap_or(self.retry)
    }

    /// 覆盖资源前缀（例如来自命令行）
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn naming(&self) -> DomainResult<NamingStrategy> {
        NamingStrategy::new(self.prefix.clone())
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.uris.is_empty() {
            return Err(DomainError::invalid_configuration(
                "at least one broker uri is required",
            ));
        }
        self.naming()?;
        if self.confirm_timeout.is_zero() {
            return Err(DomainError::invalid_configuration(
                "confirm_timeout must be positive",
            ));
        }
        self.retry.validate()?;
        for (group, retry) in &self.group_retries {
            retry.validate().map_err(|e| {
                DomainError::invalid_configuration(format!("group {group}: {e}"))
            })?;
        }
        if self.reconnect.min_delay.is_zero() || self.reconnect.min_delay > self.reconnect.max_delay
        {
            return Err(DomainError::invalid_configuration(
                "reconnect delays must satisfy 0 < min_delay <= max_delay",
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> DomainResult<Self> {
        let file: FileConfig = toml::from_str(content)?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DomainResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

// ---- 配置文件形态 ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default = "default_uris")]
    uris: Vec<String>,
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(default = "default_confirm_timeout_ms")]
    confirm_timeout_ms: u64,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    groups: BTreeMap<String, RetrySection>,
    #[serde(default)]
    reconnect: ReconnectSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    max_retries: Option<u32>,
    first_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconnectSection {
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

fn default_uris() -> Vec<String> {
    vec![DEFAULT_URI.to_string()]
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_confirm_timeout_ms() -> u64 {
    DEFAULT_CONFIRM_TIMEOUT.as_millis() as u64
}

impl RetrySection {
    /// 未填写的字段继承自 `base`
    fn resolve(&self, base: &RetryBackoffConfiguration) -> RetryBackoffConfiguration {
        RetryBackoffConfiguration::builder()
            .max_retries(self.max_retries.unwrap_or(base.max_retries()))
            .first_backoff(
                self.first_backoff_ms
                    .map_or(base.first_backoff(), Duration::from_millis),
            )
            .max_backoff(
                self.max_backoff_ms
                    .map_or(base.max_backoff(), Duration::from_millis),
            )
            .build()
    }
}

impl FileConfig {
    fn into_config(self) -> DomainResult<EventBusConfig> {
        let retry = self.retry.resolve(&RetryBackoffConfiguration::default());

        let group_retries = self
            .groups
            .iter()
            .map(|(name, section)| Ok((Group::new(name.clone())?, section.resolve(&retry))))
            .collect::<DomainResult<HashMap<_, _>>>()?;

        let reconnect = ReconnectConfiguration::builder()
            .min_delay(
                self.reconnect
                    .min_delay_ms
                    .map_or(DEFAULT_RECONNECT_MIN_DELAY, Duration::from_millis),
            )
            .max_delay(
                self.reconnect
                    .max_delay_ms
                    .map_or(DEFAULT_RECONNECT_MAX_DELAY, Duration::from_millis),
            )
            .build();

        Ok(EventBusConfig::builder()
            .uris(self.uris)
            .prefix(self.prefix)
            .confirm_timeout(Duration::from_millis(self.confirm_timeout_ms))
            .retry(retry)
            .group_retries(group_retries)
            .reconnect(reconnect)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EventBusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.prefix(), DEFAULT_PREFIX);
        assert_eq!(config.confirm_timeout(), DEFAULT_CONFIRM_TIMEOUT);
        assert_eq!(config.uris(), [DEFAULT_URI.to_string()]);
    }

    #[test]
    fn loads_toml_with_group_overrides() {
        let config = EventBusConfig::from_toml_str(
            r#"
            uris = ["amqp://rabbit-1:5672", "amqp://rabbit-2:5672"]
            prefix = "james"
            confirm_timeout_ms = 2000

            [retry]
            max_retries = 5
            first_backoff_ms = 50

            [groups.mailbox-index]
            max_retries = 2
            first_backoff_ms = 100

            [reconnect]
            min_delay_ms = 10
            max_delay_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.uris().len(), 2);
        assert_eq!(config.prefix(), "james");
        assert_eq!(config.confirm_timeout(), Duration::from_secs(2));

        let indexing = config.retry_for(&Group::new("mailbox-index").unwrap());
        assert_eq!(indexing.max_retries(), 2);
        assert_eq!(indexing.first_backoff(), Duration::from_millis(100));

        let other = config.retry_for(&Group::new("quota").unwrap());
        assert_eq!(other.max_retries(), 5);
        assert_eq!(other.first_backoff(), Duration::from_millis(50));

        assert_eq!(config.reconnect().min_delay(), Duration::from_millis(10));
    }

    #[test]
    fn rejects_invalid_files() {
        // 负数重试次数在反序列化时失败
        assert!(EventBusConfig::from_toml_str("[retry]\nmax_retries = -1").is_err());
        assert!(EventBusConfig::from_toml_str("[groups.\"bad group\"]\nmax_retries = 1").is_err());
        assert!(EventBusConfig::from_toml_str("uris = []").is_err());
        assert!(EventBusConfig::from_toml_str("prefix = \"\"").is_err());
        assert!(EventBusConfig::from_toml_str("unknown = 1").is_err());
        assert!(EventBusConfig::from_toml_str("[retry]\nfirst_backoff_ms = 0").is_err());
    }
}
