#![allow(dead_code)]

use async_trait::async_trait;
use eventbus::DistributedEventBus;
use eventbus::broker::{ConnectionPool, InMemoryBroker, PoolConfig};
use eventbus::domain::{
    Event, EventBusConfig, EventId, EventListener, Group, RegistrationKey,
    RetryBackoffConfiguration,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const PREFIX: &str = "james";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn group() -> Group {
    Group::new("mailbox-index").unwrap()
}

pub fn key(key: &str) -> RegistrationKey {
    RegistrationKey::new(key).unwrap()
}

pub fn retry(max_retries: u32) -> RetryBackoffConfiguration {
    RetryBackoffConfiguration::builder()
        .max_retries(max_retries)
        .first_backoff(Duration::from_millis(100))
        .build()
}

pub fn config(max_retries: u32) -> EventBusConfig {
    EventBusConfig::builder()
        .prefix(PREFIX)
        .retry(retry(max_retries))
        .build()
}

pub fn pool(broker: &InMemoryBroker) -> ConnectionPool {
    ConnectionPool::new(
        Arc::new(broker.clone()),
        PoolConfig::builder()
            .min_delay(Duration::from_millis(20))
            .max_delay(Duration::from_millis(200))
            .max_connect_attempts(10)
            .build(),
    )
}

pub async fn start_bus_on(pool: ConnectionPool, config: EventBusConfig) -> DistributedEventBus {
    let bus = DistributedEventBus::builder()
        .pool(pool)
        .config(config)
        .build()
        .unwrap();
    bus.start().await.unwrap();
    bus
}

pub async fn start_bus(broker: &InMemoryBroker, config: EventBusConfig) -> DistributedEventBus {
    start_bus_on(pool(broker), config).await
}

/// 轮询直到条件成立，超时返回 false
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// 记录每次调用；可配置前 N 次失败
pub struct Recorder {
    name: String,
    failures: AtomicUsize,
    calls: Mutex<Vec<(Instant, Event)>>,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Self::failing(name, 0)
    }

    pub fn failing(name: &str, times: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures: AtomicUsize::new(times),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing(name: &str) -> Arc<Self> {
        Self::failing(name, usize::MAX)
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.event_id())
            .collect()
    }
}

#[async_trait]
impl EventListener for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn event(&self, event: &Event) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), event.clone()));

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failures.fetch_sub(1, Ordering::SeqCst);
            }
            anyhow::bail!("{} failed on purpose", self.name);
        }
        Ok(())
    }
}

/// 第一次调用永不返回（模拟处理中的实例被杀死），之后正常处理
pub struct HangsOnce {
    calls: Mutex<Vec<Event>>,
}

impl HangsOnce {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(Event::event_id)
            .collect()
    }
}

#[async_trait]
impl EventListener for HangsOnce {
    fn name(&self) -> &str {
        "hangs-once"
    }

    async fn event(&self, event: &Event) -> anyhow::Result<()> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(event.clone());
            calls.len() == 1
        };
        if first {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
