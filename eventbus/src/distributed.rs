//! 分布式事件总线（DistributedEventBus）
//!
//! 生命周期：
//! - `start()`：声明共享拓扑（主交换机、死信交换机/队列）与本实例私有队列，
//!   启动私有队列消费者，并向连接池注册重连处理器；
//! - `register()` / `dispatch()`：仅在启动后可用；
//! - `stop()`：停止本地消费者、关闭 channel、删除私有队列，从不删除组队列。
//!
//! `start`/`stop` 均幂等，且可以交替多次调用。
//!
use bon::bon;
use eventbus_broker::{Connection, ConnectionPool, PoolConfig};
use eventbus_domain::{
    Event, EventBusConfig, EventBusId, EventListener, EventSerializer, JsonEventSerializer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::dead_letters::EventDeadLetters;
use crate::dispatcher::Dispatcher;
use crate::error::{BusError, BusResult};
use crate::group_registration::GroupRegistrations;
use crate::key_registration::KeyRegistrations;
use crate::reconnection::BusReconnectionHandler;
use crate::registration::{GroupRegistration, KeyRegistration, Registration, Subscription};
use crate::topology::BusTopology;

#[derive(Clone)]
pub struct DistributedEventBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    id: EventBusId,
    config: EventBusConfig,
    topology: BusTopology,
    pool: ConnectionPool,
    dispatcher: Dispatcher,
    pub(crate) keys: KeyRegistrations,
    pub(crate) groups: GroupRegistrations,
    dead_letters: EventDeadLetters,
    started: AtomicBool,
    lifecycle: Mutex<()>,
    reconnection_registered: AtomicBool,
}

impl BusInner {
    pub(crate) fn id(&self) -> EventBusId {
        self.id
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 各步骤独立执行：公共拓扑、私有队列或某个组恢复失败只记录日志，
    /// 不阻止其余注册恢复消费
    pub(crate) async fn restore(&self, connection: Arc<dyn Connection>) {
        if let Err(e) = self.redeclare_common(&*connection).await {
            error!(bus_id = %self.id, error = %e, "failed to redeclare common topology");
        }
        if let Err(e) = self.keys.restore().await {
            error!(bus_id = %self.id, error = %e, "failed to restore key registrations");
        }
        self.groups.restore().await;
    }

    async fn redeclare_common(&self, connection: &dyn Connection) -> BusResult<()> {
        let channel = connection.create_channel().await?;
        let declared = self.topology.declare_common(&*channel).await;
        let _ = channel.close().await;
        Ok(declared?)
    }
}

#[bon]
impl DistributedEventBus {
    #[builder]
    pub fn new(
        pool: ConnectionPool,
        #[builder(default)] config: EventBusConfig,
        serializer: Option<Arc<dyn EventSerializer>>,
        id: Option<EventBusId>,
    ) -> BusResult<Self> {
        config.validate()?;
        let topology = BusTopology::new(config.naming()?);
        let serializer = serializer.unwrap_or_else(|| Arc::new(JsonEventSerializer));
        let id = id.unwrap_or_default();

        let dispatcher = Dispatcher::new(
            pool.clone(),
            serializer.clone(),
            topology.naming().exchange(),
            config.confirm_timeout(),
        );
        let keys = KeyRegistrations::new(id, topology.clone(), pool.clone(), serializer.clone());
        let groups = GroupRegistrations::new(
            topology.clone(),
            pool.clone(),
            serializer.clone(),
            config.clone(),
        );
        let dead_letters = EventDeadLetters::new(
            topology.clone(),
            pool.clone(),
            serializer,
            config.confirm_timeout(),
        );

        Ok(Self {
            inner: Arc::new(BusInner {
                id,
                config,
                topology,
                pool,
                dispatcher,
                keys,
                groups,
                dead_letters,
                started: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                reconnection_registered: AtomicBool::new(false),
            }),
        })
    }
}

impl DistributedEventBus {
    /// 由配置中的重连区间得到连接池配置
    pub fn pool_config(config: &EventBusConfig) -> PoolConfig {
        PoolConfig::builder()
            .min_delay(config.reconnect().min_delay())
            .max_delay(config.reconnect().max_delay())
            .build()
    }

    pub fn id(&self) -> EventBusId {
        self.inner.id
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> &BusTopology {
        &self.inner.topology
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// 本实例私有队列的名称
    pub fn instance_queue(&self) -> String {
        self.inner.keys.queue_name()
    }

    pub fn dead_letters(&self) -> &EventDeadLetters {
        &self.inner.dead_letters
    }

    pub async fn start(&self) -> BusResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        if !self.inner.reconnection_registered.swap(true, Ordering::SeqCst) {
            let handler = BusReconnectionHandler::new(Arc::downgrade(&self.inner));
            self.inner
                .pool
                .register_reconnection_handler(Arc::new(handler))
                .await;
        }

        let channel = self.inner.pool.channel().await?;
        let declared = self.inner.topology.declare_common(&*channel).await;
        let _ = channel.close().await;
        declared?;

        self.inner.keys.start().await?;
        self.inner.pool.start();
        self.inner.started.store(true, Ordering::SeqCst);
        info!(
            bus_id = %self.inner.id,
            prefix = self.inner.topology.naming().prefix(),
            "event bus started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> BusResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.groups.stop().await;
        self.inner.keys.stop().await;
        self.inner.dispatcher.close().await;
        self.inner.dead_letters.close().await;
        info!(bus_id = %self.inner.id, "event bus stopped");
        Ok(())
    }

    pub async fn register(
        &self,
        listener: Arc<dyn EventListener>,
        subscription: impl Into<Subscription>,
    ) -> BusResult<Registration> {
        if !self.is_started() {
            return Err(BusError::NotStarted);
        }
        let bus = Arc::downgrade(&self.inner);
        let registration = match subscription.into() {
            Subscription::Group(group) => {
                let id = self.inner.groups.register(group.clone(), listener).await?;
                Registration::Group(GroupRegistration::new(bus, group, id))
            }
            Subscription::Key(key) => {
                let id = self.inner.keys.register(key.clone(), listener).await?;
                Registration::Key(KeyRegistration::new(bus, key, id))
            }
        };
        debug!(bus_id = %self.inner.id, "listener registered");
        Ok(registration)
    }

    /// 发布事件，收到发布确认后返回
    pub async fn dispatch(&self, event: &Event) -> BusResult<()> {
        if !self.is_started() {
            return Err(BusError::NotStarted);
        }
        self.inner.dispatcher.dispatch(event).await
    }
}
