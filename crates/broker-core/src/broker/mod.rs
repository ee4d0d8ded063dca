//! Resource broker
//!
//! The ResourceBroker is responsible for:
//! - Keeping one DevicePresence per monitored device
//! - Hosting and cancelling resource monitors
//! - Delivering probe outcomes, presence notifications and timer expiries
//!   into the matching state machines
//! - Executing the probes and timers those state machines request
//!
//! ## Architecture
//!
//! ```text
//!  host / cancel / get_state            ProbeTransport     PresenceSubscriber
//!            │                                ▲   │              │ events
//!            ▼                          probe │   │ outcome      ▼
//!   ┌─────────────────┐                 ┌─────┴───▼──────────────────┐
//!   │ ResourceBroker  │── registry ────▶│ DevicePresence (per device)│
//!   └─────────────────┘     lock        │   └─ ResourcePresence ...  │
//!            │                          └─────────────┬──────────────┘
//!            ▼                                        │ notifications
//!     BrokerEvent channel                             ▼
//!                                          presence-notifier thread
//!                                              └─ caller callbacks
//! ```
//!
//! ## Locking
//!
//! Lock order is registry → device → resource. Signal delivery takes the
//! registry lock only to look the device up and releases it before locking
//! the device. Probes, timers and pumps are spawned after the locks are
//! released, and callbacks never run under any of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::identity::{DeviceIdentity, ResourceIdentity};
use crate::presence::device::DevicePresence;
use crate::presence::notifier::Notifier;
use crate::presence::resource::{Effect, ResourcePresence, Transition};
use crate::presence::{DeviceState, ResourceSnapshot, ResourceState, Signal};
use crate::traits::{
    PresenceEvent, PresenceSubscriber, PresenceSubscription, ProbeOutcome, ProbeTransport,
    SubscriptionHandle,
};

/// Events emitted by the ResourceBroker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A monitor was created
    ResourceHosted { identity: ResourceIdentity },

    /// A monitor was cancelled by the application
    ResourceCancelled { identity: ResourceIdentity },

    /// A monitored resource changed state
    StateChanged {
        identity: ResourceIdentity,
        from: ResourceState,
        to: ResourceState,
    },

    /// A monitor gave up after exhausting its retries
    ResourceRetired {
        identity: ResourceIdentity,
        retries: u32,
    },

    /// A device presence subscription was established
    DeviceSubscribed { device: DeviceIdentity },

    /// A device lost its last resource and released its subscription
    DeviceReleased { device: DeviceIdentity },

    /// A probe outcome arrived for a resource that is no longer monitored
    SignalDropped {
        identity: ResourceIdentity,
        signal: Signal,
    },
}

/// State shared between the broker handle and its spawned tasks
///
/// Tasks hold it weakly so dropping the broker ends them.
struct Shared {
    /// Registry of monitored devices
    devices: Mutex<HashMap<DeviceIdentity, Arc<DevicePresence>>>,

    /// Probe transport collaborator
    transport: Arc<dyn ProbeTransport>,

    /// Presence subscription collaborator
    subscriber: Arc<dyn PresenceSubscriber>,

    /// Retry and polling schedule for every entry
    policy: RetryPolicy,

    /// Deadline for one probe outcome
    probe_timeout: Duration,

    /// Maximum silence on a presence subscription
    presence_timeout: Option<Duration>,

    /// Callback delivery queue
    notifier: Notifier,

    /// Runtime that drives probes, timers and presence pumps
    runtime: Handle,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<BrokerEvent>,
}

/// Process-wide presence broker
///
/// The broker is constructed and owned explicitly by the application; share
/// it by reference or wrap it in an `Arc`.
///
/// ## Lifecycle
///
/// 1. Create with [`ResourceBroker::new()`] inside a Tokio runtime
/// 2. Host resources with [`ResourceBroker::host_resource()`]
/// 3. Cancel them with [`ResourceBroker::cancel_host_resource()`]
/// 4. [`ResourceBroker::shutdown()`] or drop to release every subscription
///
/// ## Threading
///
/// All methods are synchronous and never wait on network I/O. Only
/// cancellation may block, for as long as a callback of the cancelled
/// resource is still running.
pub struct ResourceBroker {
    shared: Arc<Shared>,
}

impl ResourceBroker {
    /// Create a new broker
    ///
    /// # Parameters
    ///
    /// - `transport`: probe transport implementation
    /// - `subscriber`: presence subscription implementation
    /// - `config`: broker configuration
    ///
    /// # Returns
    ///
    /// A tuple of (broker, event_receiver) where event_receiver yields broker events
    pub fn new(
        transport: Box<dyn ProbeTransport>,
        subscriber: Box<dyn PresenceSubscriber>,
        config: BrokerConfig,
    ) -> Result<(Self, mpsc::Receiver<BrokerEvent>)> {
        config.validate()?;

        let runtime = Handle::try_current().map_err(|e| {
            Error::runtime(format!("ResourceBroker must be created inside a Tokio runtime: {}", e))
        })?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let shared = Shared {
            devices: Mutex::new(HashMap::new()),
            transport: Arc::from(transport),
            subscriber: Arc::from(subscriber),
            policy: config.retry_policy(),
            probe_timeout: config.probe_timeout(),
            presence_timeout: config.presence_timeout(),
            notifier: Notifier::spawn()?,
            runtime,
            event_tx: tx,
        };

        info!(
            "Resource broker started (transport: {}, max retries: {})",
            shared.transport.transport_name(),
            shared.policy.max_retries
        );

        Ok((
            Self {
                shared: Arc::new(shared),
            },
            rx,
        ))
    }

    /// Start monitoring a resource
    ///
    /// `callback` runs on the broker's notification thread for every reported
    /// transition (`Alive`, `Lost`, `Destroyed`). It may call back into the
    /// broker.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: the resource is monitored and its first probe is on its way
    /// - `Err(Error::AlreadyMonitored)`: the resource is already monitored
    /// - `Err(Error::SubscriptionFailed)`: the device subscription was refused;
    ///   nothing was created
    pub fn host_resource<F>(&self, identity: ResourceIdentity, callback: F) -> Result<()>
    where
        F: Fn(ResourceState) + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let device_id = identity.device();

        let (entry, transition) = {
            let mut devices = shared.lock_devices();

            let existing = devices.get(&device_id).cloned();
            let device = match &existing {
                Some(device) => Arc::clone(device),
                None => Arc::new(DevicePresence::new(
                    device_id.clone(),
                    Arc::clone(&shared.subscriber),
                )),
            };

            let added = device.add_resource(
                identity.clone(),
                Arc::new(callback),
                shared.policy,
                shared.notifier.clone(),
            )?;

            if existing.is_none() {
                devices.insert(device_id.clone(), Arc::clone(&device));
            }

            if let Some(subscription) = added.subscription {
                let handle = subscription.handle;
                let pump = shared.spawn_presence_pump(device_id.clone(), subscription);
                device.attach_pump(handle, pump);
                shared.emit_event(BrokerEvent::DeviceSubscribed {
                    device: device_id.clone(),
                });
            }

            (added.entry, added.transition)
        };

        info!("Hosting {}", identity);
        shared.emit_event(BrokerEvent::ResourceHosted { identity });
        shared.apply(&entry, transition);

        Ok(())
    }

    /// Stop monitoring a resource
    ///
    /// No callback for the resource runs after this returns. If a callback is
    /// running right now on another thread, this waits for it to finish.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: the monitor was removed
    /// - `Err(Error::NotFound)`: the resource was not monitored
    pub fn cancel_host_resource(&self, identity: &ResourceIdentity) -> Result<()> {
        let shared = &self.shared;
        let device_id = identity.device();

        let entry = {
            let mut devices = shared.lock_devices();
            let device = devices
                .get(&device_id)
                .cloned()
                .ok_or_else(|| Error::not_found(identity.to_string()))?;

            let removed = device
                .remove_resource(&identity.uri)
                .ok_or_else(|| Error::not_found(identity.to_string()))?;

            if removed.now_empty {
                devices.remove(&device_id);
                debug!("Removed device {} from registry", device_id);
                shared.emit_event(BrokerEvent::DeviceReleased { device: device_id });
            }

            removed.entry
        };

        entry.wait_for_delivery();

        info!("Cancelled hosting of {}", identity);
        shared.emit_event(BrokerEvent::ResourceCancelled {
            identity: identity.clone(),
        });
        Ok(())
    }

    /// Current state of a monitored resource
    ///
    /// # Returns
    ///
    /// - `Ok(ResourceState)`: last confirmed state
    /// - `Err(Error::NotFound)`: the resource is not monitored
    pub fn get_resource_state(&self, identity: &ResourceIdentity) -> Result<ResourceState> {
        self.find(identity).map(|entry| entry.current_state())
    }

    /// Detailed view of a monitored resource
    pub fn resource_snapshot(&self, identity: &ResourceIdentity) -> Result<ResourceSnapshot> {
        self.find(identity).map(|entry| entry.snapshot())
    }

    /// Presence state of a monitored device
    pub fn device_state(&self, device: &DeviceIdentity) -> Result<DeviceState> {
        self.shared
            .lock_devices()
            .get(device)
            .map(|device| device.state())
            .ok_or_else(|| Error::not_found(device.to_string()))
    }

    /// Number of devices with at least one monitored resource
    pub fn device_count(&self) -> usize {
        self.shared.lock_devices().len()
    }

    /// Number of monitored resources across all devices
    pub fn resource_count(&self) -> usize {
        self.shared
            .lock_devices()
            .values()
            .map(|device| device.resource_count())
            .sum()
    }

    /// Cancel every monitor and release every device subscription
    ///
    /// Also run on drop.
    pub fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut devices = self.shared.lock_devices();
            if devices.is_empty() {
                return;
            }
            devices
                .drain()
                .flat_map(|(_, device)| device.shutdown())
                .collect()
        };

        for entry in &entries {
            entry.wait_for_delivery();
        }
        info!("Resource broker shut down, {} monitors cancelled", entries.len());
    }

    fn find(&self, identity: &ResourceIdentity) -> Result<Arc<ResourcePresence>> {
        self.shared
            .lock_devices()
            .get(&identity.device())
            .and_then(|device| device.resource(&identity.uri))
            .ok_or_else(|| Error::not_found(identity.to_string()))
    }
}

impl Drop for ResourceBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Map a completed probe exchange to a state machine input
///
/// Transports that enforce their own deadline report it as
/// `Error::ProbeTimeout`.
fn probe_signal(seq: u64, identity: &ResourceIdentity, result: Result<ProbeOutcome>) -> Signal {
    match result {
        Ok(outcome) => Signal::from(outcome),
        Err(Error::ProbeTimeout(detail)) => {
            debug!("Probe #{} for {} timed out in transport: {}", seq, identity, detail);
            Signal::ProbeTimeout
        }
        Err(e) => {
            warn!("Probe #{} for {} failed: {}", seq, identity, e);
            Signal::ProbeError
        }
    }
}

impl Shared {
    fn lock_devices(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, Arc<DevicePresence>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute what a transition asked for
    fn apply(self: &Arc<Self>, entry: &Arc<ResourcePresence>, transition: Transition) {
        if transition.from != transition.to {
            self.emit_event(BrokerEvent::StateChanged {
                identity: entry.identity().clone(),
                from: transition.from,
                to: transition.to,
            });
        }

        for effect in transition.effects {
            match effect {
                Effect::Probe { seq } => self.spawn_probe(entry, seq),
                Effect::Schedule { delay, generation } => self.spawn_timer(entry, delay, generation),
                Effect::Retire => self.retire(entry),
            }
        }
    }

    fn spawn_probe(self: &Arc<Self>, entry: &Arc<ResourcePresence>, seq: u64) {
        let shared = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        let transport = Arc::clone(&self.transport);
        let identity = entry.identity().clone();
        let timeout = self.probe_timeout;

        self.runtime.spawn(async move {
            let signal = match tokio::time::timeout(timeout, transport.send_probe(&identity)).await {
                Ok(result) => probe_signal(seq, &identity, result),
                Err(_) => {
                    debug!("Probe #{} for {} timed out after {:?}", seq, identity, timeout);
                    Signal::ProbeTimeout
                }
            };

            let Some(shared) = shared.upgrade() else {
                return;
            };
            match weak_entry.upgrade() {
                Some(entry) => shared.dispatch_probe_outcome(&entry, seq, signal),
                None => shared.signal_dropped(&identity, signal),
            }
        });
    }

    fn spawn_timer(self: &Arc<Self>, entry: &Arc<ResourcePresence>, delay: Duration, generation: u64) {
        let shared = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let (Some(shared), Some(entry)) = (shared.upgrade(), weak_entry.upgrade()) else {
                return;
            };
            let transition = entry.on_timer(generation);
            shared.apply(&entry, transition);
        });

        entry.attach_timer(generation, task.abort_handle());
    }

    /// Forward a device subscription into the broker until it ends
    fn spawn_presence_pump(
        self: &Arc<Self>,
        device: DeviceIdentity,
        subscription: PresenceSubscription,
    ) -> AbortHandle {
        let shared = Arc::downgrade(self);
        let handle = subscription.handle;
        let mut events = subscription.events;
        let silence = self.presence_timeout;

        let task = self.runtime.spawn(async move {
            // Silence is reported once until the device speaks again
            let mut silent = false;
            loop {
                let next = match silence {
                    Some(limit) => match tokio::time::timeout(limit, events.next()).await {
                        Ok(next) => next,
                        Err(_) if silent => {
                            if shared.strong_count() == 0 {
                                break;
                            }
                            continue;
                        }
                        Err(_) => Some(PresenceEvent::Timeout),
                    },
                    None => events.next().await,
                };

                let Some(shared) = shared.upgrade() else {
                    break;
                };

                match next {
                    Some(event) => {
                        silent = event == PresenceEvent::Timeout;
                        if silent {
                            debug!("Presence subscription {} of {} went silent", handle, device);
                        }
                        shared.dispatch_device_signal(&device, handle, Signal::from(event));
                    }
                    None => {
                        warn!("Presence subscription {} of {} ended", handle, device);
                        shared.dispatch_device_signal(&device, handle, Signal::SubscriptionLost);
                        break;
                    }
                }
            }
        });

        task.abort_handle()
    }

    fn dispatch_device_signal(
        self: &Arc<Self>,
        device_id: &DeviceIdentity,
        handle: SubscriptionHandle,
        signal: Signal,
    ) {
        let device = self.lock_devices().get(device_id).cloned();
        let Some(device) = device else {
            debug!("Presence {:?} for unmonitored device {}", signal, device_id);
            return;
        };

        for (entry, transition) in device.dispatch_device_signal(handle, signal) {
            self.apply(&entry, transition);
        }
    }

    fn dispatch_probe_outcome(self: &Arc<Self>, entry: &Arc<ResourcePresence>, seq: u64, signal: Signal) {
        let identity = entry.identity();
        let device = self.lock_devices().get(&identity.device()).cloned();

        match device.and_then(|device| device.dispatch_resource_signal(entry, seq, signal)) {
            Some(transition) => self.apply(entry, transition),
            None => self.signal_dropped(identity, signal),
        }
    }

    fn signal_dropped(&self, identity: &ResourceIdentity, signal: Signal) {
        debug!("Dropping {:?} for unmonitored {}", signal, identity);
        self.emit_event(BrokerEvent::SignalDropped {
            identity: identity.clone(),
            signal,
        });
    }

    /// Remove an entry whose retries ran out
    fn retire(&self, entry: &Arc<ResourcePresence>) {
        let identity = entry.identity();
        let device_id = identity.device();
        let retries = entry.snapshot().retry_count;

        {
            let mut devices = self.lock_devices();
            let Some(device) = devices.get(&device_id).cloned() else {
                return;
            };
            let Some(now_empty) = device.retire_resource(entry) else {
                return;
            };
            if now_empty {
                devices.remove(&device_id);
                debug!("Removed device {} from registry", device_id);
                self.emit_event(BrokerEvent::DeviceReleased { device: device_id });
            }
        }

        info!("Retired {} after {} failed attempts", identity, retries);
        self.emit_event(BrokerEvent::ResourceRetired {
            identity: identity.clone(),
            retries,
        });
    }

    /// Emit a broker event
    fn emit_event(&self, event: BrokerEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                // Dropped rather than blocking the signal path
                warn!(
                    "Event channel full, dropping {:?}. Consider increasing event_channel_capacity.",
                    event
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
