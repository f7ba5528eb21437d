//! 事件监听器（EventListener）
//!
//! 组注册与键注册共用同一监听器协议。处理失败时返回错误：
//! 组注册会进入重试/死信流程，键注册仅记录日志后丢弃。
//!
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::event::Event;

/// 事件监听器：处理一个事件，可能失败
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 监听器名称（用于日志与死信记录）
    fn name(&self) -> &str;

    /// 是否处理该事件；返回 false 的事件视为处理成功
    fn is_handling(&self, _event: &Event) -> bool {
        true
    }

    /// 处理事件
    async fn event(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<T> EventListener for Arc<T>
where
    T: EventListener + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_handling(&self, event: &Event) -> bool {
        (**self).is_handling(event)
    }

    async fn event(&self, event: &Event) -> anyhow::Result<()> {
        (**self).event(event).await
    }
}

/// 由闭包构造的监听器
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn event(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}
