//! 消费者任务句柄
//!
//! 消费循环自己负责重新订阅：消费流在未被取消时结束（channel 出错、服务端
//! 取消消费者、队列被删除），按连接池的退避间隔重新获取 channel 再订阅。
//! 连接整体重建时由重连处理器直接替换整个循环。
//!
use anyhow::anyhow;
use eventbus_broker::{Channel, Delivery, DeliveryStream, PoolConfig};
use eventbus_domain::{Event, EventListener};
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BusResult;

/// 一次成功的订阅：消费所在的 channel 与其消费流
pub(crate) type Subscribed = (Arc<dyn Channel>, DeliveryStream);

/// 运行中的消费循环：用于取消与等待结束
pub(crate) struct ConsumerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// 先同步完成第一次订阅（失败直接返回错误），再在后台逐条处理投递。
    /// 每个消费流结束时关闭其 channel，未确认的消息由中间件重新入队。
    pub(crate) async fn start<S, SFut, F, Fut>(
        name: String,
        backoff: PoolConfig,
        mut resubscribe: S,
        mut handle: F,
    ) -> BusResult<Self>
    where
        S: FnMut() -> SFut + Send + 'static,
        SFut: Future<Output = BusResult<Subscribed>> + Send + 'static,
        F: FnMut(Arc<dyn Channel>, Delivery) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let first = resubscribe().await?;
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut current = Some(first);
            let mut attempt: u32 = 0;
            loop {
                let (channel, mut stream) = match current.take() {
                    Some(subscribed) => subscribed,
                    None => {
                        tokio::select! {
                            _ = cancelled.cancelled() => break,
                            _ = tokio::time::sleep(backoff.backoff(attempt)) => {}
                        }
                        attempt = attempt.saturating_add(1);
                        let result = tokio::select! {
                            _ = cancelled.cancelled() => break,
                            result = resubscribe() => result,
                        };
                        match result {
                            Ok(subscribed) => {
                                info!(consumer = %name, attempt, "consumer resubscribed");
                                attempt = 0;
                                subscribed
                            }
                            Err(e) => {
                                warn!(consumer = %name, attempt, error = %e, "resubscribe failed");
                                continue;
                            }
                        }
                    }
                };

                let stopped = loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break true,
                        next = stream.next() => match next {
                            Some(delivery) => handle(channel.clone(), delivery).await,
                            None => break false,
                        }
                    }
                };
                let _ = channel.close().await;
                if stopped {
                    debug!(consumer = %name, "consumer cancelled");
                    break;
                }
                warn!(consumer = %name, "delivery stream ended, resubscribing");
            }
        });

        Ok(Self {
            token,
            task: Some(task),
        })
    }

    pub(crate) fn shutdown(&self) {
        self.token.cancel();
    }

    /// 取消并等待消费循环结束；在消费任务自身内调用时只取消不等待
    pub(crate) async fn stop(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            if tokio::task::try_id() == Some(task.id()) {
                return;
            }
            let _ = task.await;
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 一次注册对应的监听器
#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) id: u64,
    pub(crate) listener: Arc<dyn EventListener>,
}

/// 调用监听器；panic 按失败处理
pub(crate) async fn invoke(listener: &dyn EventListener, event: &Event) -> anyhow::Result<()> {
    match AssertUnwindSafe(listener.event(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!(
            "listener {} panicked: {}",
            listener.name(),
            panic_message(&*panic)
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Panicking;

    #[async_trait]
    impl EventListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn event(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("boom")
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_listener_is_a_failure() {
        let event = Event::new("k", Vec::new());
        let err = invoke(&Panicking, &event).await.unwrap_err();

        assert_eq!(err.to_string(), "listener panicking panicked: boom");
    }
}
