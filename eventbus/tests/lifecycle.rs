mod common;

use common::{PREFIX, Recorder, config, eventually, group, init_tracing, key, pool, start_bus};
use eventbus::broker::InMemoryBroker;
use eventbus::domain::{Event, EventBusConfig};
use eventbus::{BusError, DistributedEventBus};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn register_and_dispatch_require_a_started_bus() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = DistributedEventBus::builder()
        .pool(pool(&broker))
        .config(config(2))
        .build()
        .unwrap();

    let dispatched = bus.dispatch(&Event::new("mailbox.added", Vec::new())).await;
    assert!(matches!(dispatched, Err(BusError::NotStarted)));

    let registered = bus.register(Recorder::new("early"), group()).await;
    assert!(matches!(registered, Err(BusError::NotStarted)));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configuration_fails_at_construction() {
    let broker = InMemoryBroker::new();
    let config = EventBusConfig::builder().prefix("has space").build();

    let result = DistributedEventBus::builder()
        .pool(pool(&broker))
        .config(config)
        .build();
    assert!(matches!(result, Err(BusError::Domain(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_publisher_confirm_times_out() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let config = EventBusConfig::builder()
        .prefix(PREFIX)
        .confirm_timeout(Duration::from_millis(100))
        .build();
    let bus = start_bus(&broker, config).await;

    broker.set_confirm_delay(Some(Duration::from_millis(500)));
    let result = bus.dispatch(&Event::new("mailbox.added", Vec::new())).await;
    assert!(matches!(result, Err(BusError::ConfirmTimeout { .. })));

    broker.set_confirm_delay(None);
    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_are_idempotent_and_repeatable() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    bus.start().await.unwrap();
    assert!(bus.is_started());

    bus.stop().await.unwrap();
    bus.stop().await.unwrap();
    assert!(!bus.is_started());

    bus.start().await.unwrap();
    let listener = Recorder::new("again");
    bus.register(listener.clone(), key("mailbox.added"))
        .await
        .unwrap();
    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| listener.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn handles_from_before_stop_are_noops() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let stale = bus.register(Recorder::new("stale"), group()).await.unwrap();

    bus.stop().await.unwrap();
    bus.start().await.unwrap();
    let fresh = Recorder::new("fresh");
    bus.register(fresh.clone(), group()).await.unwrap();

    stale.unregister().await.unwrap();

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| fresh.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_never_deletes_shared_resources() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    bus.register(Recorder::new("g"), group()).await.unwrap();

    bus.stop().await.unwrap();

    let names = broker.queue_names();
    for queue in [
        "james-workQueue-mailbox-index",
        "james-retryQueue-mailbox-index",
        "james-dead-letter-queue",
    ] {
        assert!(names.contains(&queue.to_string()), "{queue}");
    }
    assert!(broker.exchange_exists("james-exchange"));
    assert!(broker.exchange_exists("james-retryExchange-mailbox-index"));
}
