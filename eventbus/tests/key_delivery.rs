mod common;

use common::{Recorder, config, eventually, init_tracing, key, start_bus};
use eventbus::broker::InMemoryBroker;
use eventbus::domain::Event;
use std::time::Duration;

const EXCHANGE: &str = "james-exchange";

#[tokio::test(flavor = "multi_thread")]
async fn key_listener_receives_matching_events_only() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let listener = Recorder::new("mailbox");
    bus.register(listener.clone(), key("mailbox.*")).await.unwrap();

    let wanted = Event::new("mailbox.added", Vec::new());
    bus.dispatch(&wanted).await.unwrap();
    bus.dispatch(&Event::new("user.created", Vec::new()))
        .await
        .unwrap();

    assert!(eventually(|| listener.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(listener.event_ids(), vec![wanted.event_id()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_instance_receives_key_events() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let a = start_bus(&broker, config(2)).await;
    let b = start_bus(&broker, config(2)).await;
    let on_a = Recorder::new("a");
    let on_b = Recorder::new("b");
    a.register(on_a.clone(), key("mailbox.#")).await.unwrap();
    b.register(on_b.clone(), key("mailbox.#")).await.unwrap();

    a.dispatch(&Event::new("mailbox.user.added", Vec::new()))
        .await
        .unwrap();

    assert!(eventually(|| on_a.count() == 1 && on_b.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn unroutable_event_is_silently_dropped() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;

    bus.dispatch(&Event::new("nobody.listens", b"x".to_vec()))
        .await
        .unwrap();

    for queue in broker.queue_names() {
        assert_eq!(broker.queue_info(&queue).unwrap().messages, 0, "{queue}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_key_listener_is_not_retried() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let listener = Recorder::always_failing("fragile");
    bus.register(listener.clone(), key("mailbox.added"))
        .await
        .unwrap();

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();

    assert!(eventually(|| listener.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.count(), 1);
    assert_eq!(bus.dead_letters().count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn last_unregister_removes_the_binding() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let queue = bus.instance_queue();

    let first = bus
        .register(Recorder::new("first"), key("mailbox.added"))
        .await
        .unwrap();
    let second = bus
        .register(Recorder::new("second"), key("mailbox.added"))
        .await
        .unwrap();
    assert!(broker.has_binding(EXCHANGE, &queue, "mailbox.added"));

    first.unregister().await.unwrap();
    assert!(broker.has_binding(EXCHANGE, &queue, "mailbox.added"));

    second.unregister().await.unwrap();
    assert!(!broker.has_binding(EXCHANGE, &queue, "mailbox.added"));

    second.unregister().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn instance_queue_is_private_and_removed_on_stop() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let a = start_bus(&broker, config(2)).await;
    let b = start_bus(&broker, config(2)).await;

    let queue = a.instance_queue();
    assert_ne!(queue, b.instance_queue());
    assert!(queue.starts_with("james-eventbus-"));
    assert!(broker.queue_names().contains(&queue));

    a.stop().await.unwrap();
    a.stop().await.unwrap();

    assert!(!broker.queue_names().contains(&queue));
    assert!(broker.queue_names().contains(&b.instance_queue()));
}
