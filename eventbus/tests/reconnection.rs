mod common;

use common::{
    HangsOnce, Recorder, config, eventually, group, init_tracing, key, pool, start_bus,
    start_bus_on,
};
use eventbus::broker::{Broker, Channel, Connection, InMemoryBroker};
use eventbus::domain::Event;

const WORK_QUEUE: &str = "james-workQueue-mailbox-index";

fn has_consumer(broker: &InMemoryBroker, queue: &str) -> bool {
    broker
        .queue_info(queue)
        .is_some_and(|info| info.consumers == 1)
}

#[tokio::test(flavor = "multi_thread")]
async fn bus_recovers_after_connection_loss() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let on_group = Recorder::new("group");
    let on_key = Recorder::new("key");
    bus.register(on_group.clone(), group()).await.unwrap();
    bus.register(on_key.clone(), key("mailbox.*")).await.unwrap();
    let instance_queue = bus.instance_queue();

    broker.disconnect_all();

    assert!(eventually(|| has_consumer(&broker, &instance_queue)).await);
    assert!(eventually(|| has_consumer(&broker, WORK_QUEUE)).await);
    assert!(broker.has_binding("james-exchange", &instance_queue, "mailbox.*"));

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| on_group.count() == 1 && on_key.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn bus_recovers_after_broker_restart() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let on_group = Recorder::new("group");
    let on_key = Recorder::new("key");
    bus.register(on_group.clone(), group()).await.unwrap();
    bus.register(on_key.clone(), key("mailbox.*")).await.unwrap();
    let instance_queue = bus.instance_queue();

    broker.restart();

    assert!(eventually(|| has_consumer(&broker, &instance_queue)).await);
    assert!(eventually(|| has_consumer(&broker, WORK_QUEUE)).await);

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| on_group.count() == 1 && on_key.count() == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_group_event_is_redelivered_after_reconnection() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let listener = HangsOnce::new();
    bus.register(listener.clone(), group()).await.unwrap();

    let event = Event::new("mailbox.added", Vec::new());
    bus.dispatch(&event).await.unwrap();
    assert!(eventually(|| listener.count() == 1).await);

    broker.disconnect_all();

    assert!(eventually(|| listener.count() == 2).await);
    assert_eq!(listener.event_ids(), vec![event.event_id(); 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_consumers_are_restored_when_instance_queue_restore_fails() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let pool = pool(&broker);
    let bus = start_bus_on(pool.clone(), config(2)).await;
    let stuck = HangsOnce::new();
    let on_key = Recorder::new("key");
    bus.register(stuck.clone(), group()).await.unwrap();
    bus.register(on_key.clone(), key("mailbox.*")).await.unwrap();
    let instance_queue = bus.instance_queue();

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| stuck.count() == 1 && on_key.count() == 1).await);

    // 另一个连接在总线重连前抢先声明同名的独占队列
    let squatter = broker.connect().await.unwrap();
    let squatter_channel = squatter.create_channel().await.unwrap();
    let bus_connection = pool.connection().await.unwrap();
    broker.set_available(false);
    broker.disconnect(bus_connection.id());
    squatter_channel
        .declare_queue(&bus.topology().instance_queue(&bus.id()))
        .await
        .unwrap();
    broker.set_available(true);

    // 卡住的旧消费循环不会自行恢复，只有重建的组消费者能拿到重新入队的事件
    assert!(eventually(|| stuck.count() == 2).await);
    assert_eq!(broker.queue_info(&instance_queue).unwrap().consumers, 0);

    squatter.close().await;
    assert!(eventually(|| has_consumer(&broker, &instance_queue)).await);
    assert!(eventually(|| broker.has_binding("james-exchange", &instance_queue, "mailbox.*")).await);

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| stuck.count() == 3 && on_key.count() == 2).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn consumers_resubscribe_when_cancelled_by_the_broker() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let bus = start_bus(&broker, config(2)).await;
    let on_group = Recorder::new("group");
    let on_key = Recorder::new("key");
    bus.register(on_group.clone(), group()).await.unwrap();
    bus.register(on_key.clone(), key("mailbox.*")).await.unwrap();
    let instance_queue = bus.instance_queue();
    let connections = broker.connection_count();

    broker.cancel_consumers(WORK_QUEUE);
    broker.cancel_consumers(&instance_queue);
    assert_eq!(broker.queue_info(WORK_QUEUE).unwrap().consumers, 0);

    assert!(eventually(|| has_consumer(&broker, WORK_QUEUE)).await);
    assert!(eventually(|| has_consumer(&broker, &instance_queue)).await);
    assert!(broker.has_binding("james-exchange", &instance_queue, "mailbox.*"));
    assert_eq!(broker.connection_count(), connections);

    bus.dispatch(&Event::new("mailbox.added", Vec::new()))
        .await
        .unwrap();
    assert!(eventually(|| on_group.count() == 1 && on_key.count() == 1).await);
}
