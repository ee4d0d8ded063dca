//! Per-device presence aggregation
//!
//! A `DevicePresence` holds the single presence subscription of one device and
//! the [`ResourcePresence`] entries of every monitored resource hosted on it.
//! Device-wide signals are fanned out to every entry; probe outcomes are
//! routed to one entry by URI.
//!
//! Lock order: the device lock is always taken before an entry lock.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::notifier::Notifier;
use super::resource::{PresenceCallback, ResourcePresence, Signal, Transition};
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::identity::{DeviceIdentity, ResourceIdentity};
use crate::traits::{PresenceSubscriber, PresenceSubscription, SubscriptionHandle};

/// Reachability of a device as reported by its presence subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Subscribed, no presence traffic seen yet
    Requested,
    /// Device announced itself
    Alive,
    /// Device stopped announcing or the subscription failed
    Lost,
}

/// Outcome of [`DevicePresence::add_resource`]
pub(crate) struct Added {
    pub(crate) entry: Arc<ResourcePresence>,
    pub(crate) transition: Transition,
    /// Set when this call established the device subscription
    pub(crate) subscription: Option<PresenceSubscription>,
}

/// Outcome of [`DevicePresence::remove_resource`]
pub(crate) struct Removed {
    pub(crate) entry: Arc<ResourcePresence>,
    /// The device has no resources left and released its subscription
    pub(crate) now_empty: bool,
}

struct DeviceInner {
    resources: HashMap<String, Arc<ResourcePresence>>,
    state: DeviceState,
    subscription: Option<SubscriptionHandle>,
    pump: Option<AbortHandle>,
}

/// Presence aggregation for one device
pub struct DevicePresence {
    identity: DeviceIdentity,
    subscriber: Arc<dyn PresenceSubscriber>,
    inner: Mutex<DeviceInner>,
}

impl DevicePresence {
    pub(crate) fn new(identity: DeviceIdentity, subscriber: Arc<dyn PresenceSubscriber>) -> Self {
        Self {
            identity,
            subscriber,
            inner: Mutex::new(DeviceInner {
                resources: HashMap::new(),
                state: DeviceState::Requested,
                subscription: None,
                pump: None,
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    /// Look up the entry for `uri`
    pub fn resource(&self, uri: &str) -> Option<Arc<ResourcePresence>> {
        self.lock().resources.get(uri).cloned()
    }

    /// Create and arm the entry for `identity`
    ///
    /// The first resource of a device establishes the device subscription;
    /// if that fails nothing is added.
    ///
    /// # Returns
    ///
    /// - `Ok(Added)`: entry armed, its first probe still has to be sent
    /// - `Err(Error::AlreadyMonitored)`: an entry for the URI exists
    /// - `Err(Error::SubscriptionFailed)`: the device subscription was refused
    pub(crate) fn add_resource(
        &self,
        identity: ResourceIdentity,
        callback: PresenceCallback,
        policy: RetryPolicy,
        notifier: Notifier,
    ) -> Result<Added> {
        let mut inner = self.lock();

        if inner.resources.contains_key(&identity.uri) {
            return Err(Error::already_monitored(identity.to_string()));
        }

        let subscription = if inner.subscription.is_none() {
            let subscription = self
                .subscriber
                .subscribe(&self.identity)
                .map_err(|e| Error::subscription_failed(format!("{}: {}", self.identity, e)))?;
            info!("Subscribed to presence of {} ({})", self.identity, subscription.handle);
            inner.subscription = Some(subscription.handle);
            inner.state = DeviceState::Requested;
            Some(subscription)
        } else {
            None
        };

        let uri = identity.uri.clone();
        let (entry, transition) = ResourcePresence::arm(identity, callback, policy, notifier);
        inner.resources.insert(uri, Arc::clone(&entry));

        Ok(Added {
            entry,
            transition,
            subscription,
        })
    }

    /// Record the task pumping the subscription `handle`
    pub(crate) fn attach_pump(&self, handle: SubscriptionHandle, pump: AbortHandle) {
        let mut inner = self.lock();
        if inner.subscription == Some(handle) {
            inner.pump = Some(pump);
        } else {
            pump.abort();
        }
    }

    /// Cancel and remove the entry for `uri`
    ///
    /// Releases the device subscription when the last entry goes. The caller
    /// still has to wait for in-flight callback delivery on the returned
    /// entry, after dropping its own locks.
    pub(crate) fn remove_resource(&self, uri: &str) -> Option<Removed> {
        let mut inner = self.lock();
        let entry = inner.resources.remove(uri)?;
        entry.cancel();

        let now_empty = inner.resources.is_empty();
        if now_empty {
            self.release(&mut inner);
        }

        Some(Removed { entry, now_empty })
    }

    /// Remove `entry` after its retries ran out
    ///
    /// Returns `None` if the URI is now held by a different entry (the
    /// resource was cancelled and hosted again meanwhile), otherwise whether
    /// the device became empty.
    pub(crate) fn retire_resource(&self, entry: &Arc<ResourcePresence>) -> Option<bool> {
        let mut inner = self.lock();
        let uri = &entry.identity().uri;
        match inner.resources.get(uri) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            _ => return None,
        }
        inner.resources.remove(uri);

        let now_empty = inner.resources.is_empty();
        if now_empty {
            self.release(&mut inner);
        }
        Some(now_empty)
    }

    /// Cancel every entry and release the subscription
    pub(crate) fn shutdown(&self) -> Vec<Arc<ResourcePresence>> {
        let mut inner = self.lock();
        let entries: Vec<_> = inner.resources.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.cancel();
        }
        self.release(&mut inner);
        entries
    }

    /// Apply a device-wide signal from subscription `handle` to every entry
    ///
    /// Signals from a subscription that is no longer current are dropped.
    pub(crate) fn dispatch_device_signal(
        &self,
        handle: SubscriptionHandle,
        signal: Signal,
    ) -> Vec<(Arc<ResourcePresence>, Transition)> {
        let mut inner = self.lock();
        if inner.subscription != Some(handle) {
            debug!("Dropping {:?} from stale subscription {} of {}", signal, handle, self.identity);
            return Vec::new();
        }

        match signal {
            Signal::PresenceCreated => inner.state = DeviceState::Alive,
            Signal::PresenceStopped | Signal::PresenceDestroyed | Signal::SubscriptionLost => {
                inner.state = DeviceState::Lost
            }
            _ => {}
        }

        debug!(
            "Presence {:?} for {}, fanning out to {} resources",
            signal,
            self.identity,
            inner.resources.len()
        );
        inner
            .resources
            .values()
            .map(|entry| (Arc::clone(entry), entry.on_signal(signal)))
            .collect()
    }

    /// Route the outcome of probe `seq` to `entry`
    ///
    /// Returns `None` unless `entry` is still the one registered for its URI,
    /// which happens when the outcome races with cancellation or the resource
    /// was cancelled and hosted again meanwhile.
    pub(crate) fn dispatch_resource_signal(
        &self,
        entry: &Arc<ResourcePresence>,
        seq: u64,
        signal: Signal,
    ) -> Option<Transition> {
        let inner = self.lock();
        let uri = &entry.identity().uri;
        match inner.resources.get(uri) {
            Some(current) if Arc::ptr_eq(current, entry) => Some(entry.on_probe_outcome(seq, signal)),
            _ => {
                debug!("No current resource {} on {} for {:?}", uri, self.identity, signal);
                None
            }
        }
    }

    fn release(&self, inner: &mut DeviceInner) {
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(handle) = inner.subscription.take() {
            self.subscriber.unsubscribe(&self.identity, handle);
            info!("Released presence subscription {} of {}", handle, self.identity);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DevicePresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("DevicePresence")
            .field("identity", &self.identity)
            .field("state", &inner.state)
            .field("resources", &inner.resources.len())
            .field("subscription", &inner.subscription)
            .finish()
    }
}
