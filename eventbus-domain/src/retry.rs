//! 重试退避配置（RetryBackoffConfiguration）
//!
//! 每个组的最大重试次数与指数退避参数。第 n 次重试（n 从 0 计）的延迟为
//! `first_backoff * 2^n`，并以 `max_backoff` 封顶。延迟由消息中间件的消息 TTL
//! 实现，进程内不持有任何定时器。
//!
use bon::Builder;
use std::time::Duration;

use crate::error::{DomainError, DomainResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 单个组允许的最大重试次数上限
pub const MAX_RETRIES_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct RetryBackoffConfiguration {
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    #[builder(default = DEFAULT_FIRST_BACKOFF)]
    first_backoff: Duration,
    #[builder(default = DEFAULT_MAX_BACKOFF)]
    max_backoff: Duration,
}

/// 一次失败后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 以新的重试次数在 `delay` 之后重新投递
    Retry { next_retry_count: u32, delay: Duration },
    /// 重试耗尽，进入死信队列
    DeadLetter,
}

impl Default for RetryBackoffConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryBackoffConfiguration {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(DomainError::invalid_configuration(format!(
                "max_retries {} exceeds limit {MAX_RETRIES_LIMIT}",
                self.max_retries
            )));
        }
        if self.first_backoff.is_zero() {
            return Err(DomainError::invalid_configuration(
                "first_backoff must be positive",
            ));
        }
        if self.first_backoff > self.max_backoff {
            return Err(DomainError::invalid_configuration(format!(
                "first_backoff {:?} is greater than max_backoff {:?}",
                self.first_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// 第 `retry_count` 次失败之后的等待时间
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.first_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                next_retry_count: retry_count + 1,
                delay: self.backoff_for(retry_count),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32) -> RetryBackoffConfiguration {
        RetryBackoffConfiguration::builder()
            .max_retries(max_retries)
            .first_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(1))
            .build()
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = config(10);
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for(4), Duration::from_secs(1));
        assert_eq!(config.backoff_for(40), Duration::from_secs(1));
    }

    #[test]
    fn decides_dead_letter_once_retries_are_exhausted() {
        let config = config(2);
        assert_eq!(
            config.decide(0),
            RetryDecision::Retry {
                next_retry_count: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            config.decide(1),
            RetryDecision::Retry {
                next_retry_count: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(config.decide(2), RetryDecision::DeadLetter);
        assert_eq!(config.decide(7), RetryDecision::DeadLetter);
    }

    #[test]
    fn zero_retries_dead_letters_immediately() {
        assert_eq!(config(0).decide(0), RetryDecision::DeadLetter);
    }

    #[test]
    fn validation() {
        assert!(RetryBackoffConfiguration::default().validate().is_ok());
        assert!(config(MAX_RETRIES_LIMIT + 1).validate().is_err());
        assert!(
            RetryBackoffConfiguration::builder()
                .first_backoff(Duration::ZERO)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            RetryBackoffConfiguration::builder()
                .first_backoff(Duration::from_secs(10))
                .max_backoff(Duration::from_secs(1))
                .build()
                .validate()
                .is_err()
        );
    }
}
