//! 在进程内消息中间件上演示分布式事件总线：
//! 两个实例共享一个消费组，另有一个按路由键注册的监听器，
//! 以及一个总是失败的组，其事件经过重试后进入死信队列。

use anyhow::Context;
use clap::Parser;
use eventbus::DistributedEventBus;
use eventbus::broker::{ConnectionPool, InMemoryBroker};
use eventbus::domain::listener::FnListener;
use eventbus::domain::{Event, EventBusConfig, Group, RegistrationKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "demo", about = "Distributed mail event bus on an in-process broker")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resource prefix, overrides the configuration file
    #[arg(long)]
    prefix: Option<String>,

    /// Number of events to dispatch
    #[arg(long, default_value_t = 5)]
    events: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EventBusConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EventBusConfig::default(),
    };
    if let Some(prefix) = cli.prefix {
        config = config.with_prefix(prefix);
    }
    config.validate()?;
    info!(uris = ?config.uris(), prefix = config.prefix(), "configuration loaded");

    let broker = InMemoryBroker::new();
    let pool_config = DistributedEventBus::pool_config(&config);
    let pools = [
        ConnectionPool::new(Arc::new(broker.clone()), pool_config),
        ConnectionPool::new(Arc::new(broker.clone()), pool_config),
    ];

    let mut buses = Vec::new();
    for pool in &pools {
        let bus = DistributedEventBus::builder()
            .pool(pool.clone())
            .config(config.clone())
            .build()?;
        bus.start().await?;
        buses.push(bus);
    }

    let indexing = Group::new("mailbox-index")?;
    let quota = Group::new("quota-update")?;
    let handled = Arc::new(AtomicUsize::new(0));

    for (index, bus) in buses.iter().enumerate() {
        let counter = handled.clone();
        let listener = FnListener::new(format!("indexer-{index}"), move |event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                info!(instance = index, event_id = %event.event_id(), "indexed");
                Ok(())
            }
        });
        bus.register(Arc::new(listener), indexing.clone()).await?;
    }

    let first = &buses[0];
    first
        .register(
            Arc::new(FnListener::new("mailbox-watcher", |event: Event| async move {
                info!(routing_key = event.routing_key(), "mailbox change observed");
                Ok(())
            })),
            RegistrationKey::new("mailbox.*")?,
        )
        .await?;
    first
        .register(
            Arc::new(FnListener::new("quota", |event: Event| async move {
                anyhow::bail!("quota store unavailable for {}", event.event_id())
            })),
            quota.clone(),
        )
        .await?;

    for i in 0..cli.events {
        let event = Event::new("mailbox.added", format!("message {i}").into_bytes());
        buses[i % buses.len()].dispatch(&event).await?;
    }

    let expected = cli.events;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        let dead = first.dead_letters().count().await?;
        // 每个事件在 quota 组耗尽重试后各产生一条死信
        if handled.load(Ordering::SeqCst) >= expected && dead >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!(handled = handled.load(Ordering::SeqCst), "indexing finished");

    while let Some(dead) = first.dead_letters().fetch().await? {
        warn!(
            group = ?dead.group().map(Group::as_str),
            retry_count = dead.retry_count(),
            reason = dead.reason().unwrap_or_default(),
            at = ?dead.dead_lettered_at(),
            "dead letter"
        );
    }

    for bus in &buses {
        bus.stop().await?;
    }
    for pool in &pools {
        pool.shutdown().await;
    }
    Ok(())
}
