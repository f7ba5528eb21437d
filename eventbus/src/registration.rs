//! 注册句柄
//!
//! `register` 返回的句柄只持有总线的弱引用：总线停止或被丢弃后，
//! `unregister` 为空操作；重复注销同样为空操作。
//!
use eventbus_domain::{Group, RegistrationKey};
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::distributed::BusInner;
use crate::error::BusResult;

/// 监听器的订阅方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// 组内竞争消费，带重试与死信
    Group(Group),
    /// 本实例按路由键接收，失败即丢弃
    Key(RegistrationKey),
}

impl From<Group> for Subscription {
    fn from(group: Group) -> Self {
        Subscription::Group(group)
    }
}

impl From<RegistrationKey> for Subscription {
    fn from(key: RegistrationKey) -> Self {
        Subscription::Key(key)
    }
}

pub enum Registration {
    Key(KeyRegistration),
    Group(GroupRegistration),
}

impl Registration {
    pub async fn unregister(&self) -> BusResult<()> {
        match self {
            Registration::Key(registration) => registration.unregister().await,
            Registration::Group(registration) => registration.unregister().await,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Registration::Key(registration) => registration.active.load(Ordering::SeqCst),
            Registration::Group(registration) => registration.active.load(Ordering::SeqCst),
        }
    }
}

pub struct KeyRegistration {
    bus: Weak<BusInner>,
    key: RegistrationKey,
    id: u64,
    active: AtomicBool,
}

impl KeyRegistration {
    pub(crate) fn new(bus: Weak<BusInner>, key: RegistrationKey, id: u64) -> Self {
        Self {
            bus,
            key,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }

    pub async fn unregister(&self) -> BusResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.bus.upgrade() {
            Some(bus) => bus.keys.unregister(&self.key, self.id).await,
            None => Ok(()),
        }
    }
}

pub struct GroupRegistration {
    bus: Weak<BusInner>,
    group: Group,
    id: u64,
    active: AtomicBool,
}

impl GroupRegistration {
    pub(crate) fn new(bus: Weak<BusInner>, group: Group, id: u64) -> Self {
        Self {
            bus,
            group,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub async fn unregister(&self) -> BusResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.groups.unregister(&self.group, self.id).await;
        }
        Ok(())
    }
}
