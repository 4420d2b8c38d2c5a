use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Opaque identifier of a physically discoverable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Presence change reported by a [`DeviceMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceId),
    Detached(DeviceId),
}

impl DeviceEvent {
    /// The device this event refers to.
    pub fn device(&self) -> DeviceId {
        match self {
            DeviceEvent::Attached(id) | DeviceEvent::Detached(id) => *id,
        }
    }
}

/// Callback invoked on the monitor's producer context.
pub type DeviceCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Source of device attach/detach notifications.
pub trait DeviceMonitor: Send + Sync {
    /// Register `callback` until the returned [`Subscription`] is dropped.
    ///
    /// Implementations replay an `Attached` event for every device that is
    /// already present when the subscription is created.
    fn subscribe(&self, callback: DeviceCallback) -> Subscription;
}

/// Handle to a monitor registration. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` exactly once on release.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that owns no registration.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// In-process device monitor driven by explicit `attach`/`detach` calls.
///
/// Callbacks run on the thread calling `attach`/`detach`. Presence changes
/// and their notifications are serialized: every subscriber observes events
/// in the order the attached set changed, and a new subscriber's replay is
/// never interleaved with a concurrent change. Callbacks must not call back
/// into the monitor's `attach`, `detach` or `subscribe`.
#[derive(Clone, Default)]
pub struct ManualDeviceMonitor {
    inner: Arc<Mutex<MonitorInner>>,
    dispatch: Arc<Mutex<()>>,
}

#[derive(Default)]
struct MonitorInner {
    attached: BTreeSet<DeviceId>,
    subscribers: BTreeMap<u64, DeviceCallback>,
    next_subscriber: u64,
}

impl ManualDeviceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `device` present. Returns `false` if it was already attached.
    pub fn attach(&self, device: DeviceId) -> bool {
        self.change(DeviceEvent::Attached(device), |attached| {
            attached.insert(device)
        })
    }

    /// Mark `device` gone. Returns `false` if it was not attached.
    pub fn detach(&self, device: DeviceId) -> bool {
        self.change(DeviceEvent::Detached(device), |attached| {
            attached.remove(&device)
        })
    }

    /// Apply `update` and notify subscribers while holding the dispatch lock.
    fn change(
        &self,
        event: DeviceEvent,
        update: impl FnOnce(&mut BTreeSet<DeviceId>) -> bool,
    ) -> bool {
        let _dispatch = lock(&self.dispatch);
        let subscribers = {
            let mut inner = lock(&self.inner);
            if !update(&mut inner.attached) {
                return false;
            }
            inner.subscribers.values().cloned().collect::<Vec<_>>()
        };

        debug!(?event, subscribers = subscribers.len(), "device presence changed");
        for callback in subscribers {
            callback(event);
        }
        true
    }

    /// Currently attached devices, ascending.
    pub fn attached(&self) -> Vec<DeviceId> {
        lock(&self.inner).attached.iter().copied().collect()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

impl DeviceMonitor for ManualDeviceMonitor {
    fn subscribe(&self, callback: DeviceCallback) -> Subscription {
        let _dispatch = lock(&self.dispatch);
        let (id, present) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_subscriber;
            inner.next_subscriber = inner.next_subscriber.wrapping_add(1);
            inner.subscribers.insert(id, Arc::clone(&callback));
            (id, inner.attached.iter().copied().collect::<Vec<_>>())
        };

        for device in present {
            callback(DeviceEvent::Attached(device));
        }

        let registry = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = registry.upgrade() {
                lock(&inner).subscribers.remove(&id);
            }
        })
    }
}

impl fmt::Debug for ManualDeviceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ManualDeviceMonitor")
            .field("attached", &inner.attached)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
