//! 连接池与断线重连
//!
//! 进程内所有组件共享一个连接：
//! - `connection()` 返回当前连接，连接失效时按指数退避重新建立；
//! - `start()` 启动监督任务，连接断开后主动重连，并依次执行已注册的
//!   `ReconnectionHandler`（重新声明拓扑、重启消费者等）；
//! - `shutdown()` 停止监督任务并关闭连接。
//!
use crate::broker::{Broker, Channel, Connection};
use crate::error::{BrokerError, BrokerResult};
use crate::topology::QueueSpec;
use async_trait::async_trait;
use bon::Builder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 重连退避配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct PoolConfig {
    #[builder(default = Duration::from_millis(100))]
    min_delay: Duration,
    #[builder(default = Duration::from_secs(5))]
    max_delay: Duration,
    /// 单次 `connection()` 调用内的最大尝试次数
    #[builder(default = 5)]
    max_connect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolConfig {
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_connect_attempts(&self) -> u32 {
        self.max_connect_attempts
    }

    /// 第 `attempt` 次失败后的等待时间：`min_delay * 2^attempt`，不超过 `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.min_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// 连接重新建立后执行的回调
#[async_trait]
pub trait ReconnectionHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_reconnection(&self, connection: Arc<dyn Connection>) -> anyhow::Result<()>;
}

/// 重连后重新声明一个队列（例如已随旧连接删除的独占队列）
pub struct DeclareQueueOnReconnect {
    name: String,
    spec: QueueSpec,
}

impl DeclareQueueOnReconnect {
    pub fn new(spec: QueueSpec) -> Self {
        Self {
            name: format!("declare-queue:{}", spec.name()),
            spec,
        }
    }
}

#[async_trait]
impl ReconnectionHandler for DeclareQueueOnReconnect {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_reconnection(&self, connection: Arc<dyn Connection>) -> anyhow::Result<()> {
        let channel = connection.create_channel().await?;
        channel.declare_queue(&self.spec).await?;
        channel.close().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    broker: Arc<dyn Broker>,
    config: PoolConfig,
    current: Mutex<Option<Arc<dyn Connection>>>,
    handlers: RwLock<Vec<Arc<dyn ReconnectionHandler>>>,
    token: CancellationToken,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// 累计建立的连接数
    established: AtomicU64,
}

impl ConnectionPool {
    pub fn new(broker: Arc<dyn Broker>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                broker,
                config,
                current: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                token: CancellationToken::new(),
                supervisor: std::sync::Mutex::new(None),
                established: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// 当前可用的连接；已断开时重新建立
    pub async fn connection(&self) -> BrokerResult<Arc<dyn Connection>> {
        if self.is_shutdown() {
            return Err(BrokerError::PoolShutdown);
        }

        let mut current = self.inner.current.lock().await;
        if let Some(connection) = current.as_ref().filter(|c| c.is_open()) {
            return Ok(connection.clone());
        }

        let connection = self.connect_with_retry().await?;
        self.inner.established.fetch_add(1, Ordering::SeqCst);
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// 在当前连接上创建 channel；连接恰好失效时换新连接重试一次
    pub async fn channel(&self) -> BrokerResult<Arc<dyn Channel>> {
        match self.connection().await?.create_channel().await {
            Err(e) if e.is_connection_error() => {
                debug!(error = %e, "channel creation failed, retrying on a fresh connection");
                self.connection().await?.create_channel().await
            }
            other => other,
        }
    }

    async fn connect_with_retry(&self) -> BrokerResult<Arc<dyn Connection>> {
        let attempts = self.inner.config.max_connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.inner.broker.connect().await {
                Ok(connection) => {
                    info!(connection = connection.id(), attempt, "connected to broker");
                    return Ok(connection);
                }
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.inner.config.backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "broker connection failed, retrying");
                    tokio::select! {
                        _ = self.inner.token.cancelled() => return Err(BrokerError::PoolShutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, attempts, "broker connection failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    pub async fn register_reconnection_handler(&self, handler: Arc<dyn ReconnectionHandler>) {
        debug!(handler = handler.name(), "reconnection handler registered");
        self.inner.handlers.write().await.push(handler);
    }

    /// 启动断线监督任务；重复调用为空操作
    pub fn start(&self) {
        let mut supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() || self.is_shutdown() {
            return;
        }
        *supervisor = Some(tokio::spawn(self.clone().supervise()));
    }

    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = supervisor {
            let _ = task.await;
        }
        if let Some(connection) = self.inner.current.lock().await.take() {
            connection.close().await;
        }
        info!("connection pool shut down");
    }

    async fn supervise(self) {
        let token = self.inner.token.clone();
        let mut last: Option<u64> = None;

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.connection() => result,
            };
            let connection = match result {
                Ok(connection) => connection,
                Err(BrokerError::PoolShutdown) => break,
                Err(e) => {
                    warn!(error = %e, "reconnection failed, will retry");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.config.max_delay) => {}
                    }
                    continue;
                }
            };

            // 监督任务启动前连接可能已经被替换过
            let reconnected = match last {
                Some(id) => id != connection.id(),
                None => self.inner.established.load(Ordering::SeqCst) > 1,
            };
            if reconnected {
                self.run_handlers(connection.clone()).await;
            }
            last = Some(connection.id());

            tokio::select! {
                _ = token.cancelled() => break,
                _ = connection.closed() => {
                    warn!(connection = connection.id(), "broker connection lost, reconnecting");
                }
            }
        }
        debug!("connection supervisor stopped");
    }

    async fn run_handlers(&self, connection: Arc<dyn Connection>) {
        let handlers = self.inner.handlers.read().await.clone();
        info!(
            connection = connection.id(),
            handlers = handlers.len(),
            "running reconnection handlers"
        );
        for handler in handlers {
            if let Err(e) = handler.handle_reconnection(connection.clone()).await {
                error!(handler = handler.name(), error = %e, "reconnection handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = PoolConfig::builder()
            .min_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .build();

        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_secs(1));
        assert_eq!(config.backoff(64), Duration::from_secs(1));
    }
}
