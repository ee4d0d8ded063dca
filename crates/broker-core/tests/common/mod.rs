//! Test doubles and common utilities for broker contract tests
//!
//! The doubles stand in for the network side: a probe transport whose answer
//! is set by the test, and a presence subscriber whose notifications are
//! pushed by the test.

#![allow(dead_code)]

use broker_core::error::{Error, Result};
use broker_core::traits::{
    PresenceEvent, PresenceSubscriber, PresenceSubscription, ProbeOutcome, ProbeTransport,
    SubscriptionHandle,
};
use broker_core::{
    BrokerConfig, BrokerEvent, Connectivity, DeviceIdentity, ResourceBroker, ResourceIdentity,
    ResourceState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// How the controlled transport answers probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Answer `Alive` immediately
    Alive,
    /// Answer `Lost` immediately
    Lost,
    /// Fail at the transport level
    Fail,
    /// Never answer (the broker's probe timeout fires)
    Hang,
    /// Answer `Alive` once the test releases a permit
    Gated,
}

/// A probe transport whose behavior is switched by the test
#[derive(Clone)]
pub struct ControlledTransport {
    mode: Arc<Mutex<ProbeMode>>,
    probe_count: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
    script: Arc<Mutex<VecDeque<(Duration, ProbeOutcome)>>>,
}

impl ControlledTransport {
    pub fn new(mode: ProbeMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            probe_count: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Answer the next probes, in order, with `outcome` after `delay`
    ///
    /// The mode applies again once the script runs out.
    pub fn script(&self, answers: impl IntoIterator<Item = (Duration, ProbeOutcome)>) {
        self.script.lock().unwrap().extend(answers);
    }

    pub fn set_mode(&self, mode: ProbeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of probes sent so far
    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    /// Let `n` gated probes complete
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait::async_trait]
impl ProbeTransport for ControlledTransport {
    async fn send_probe(&self, _identity: &ResourceIdentity) -> Result<ProbeOutcome> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        if let Some((delay, outcome)) = scripted {
            tokio::time::sleep(delay).await;
            return Ok(outcome);
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            ProbeMode::Alive => Ok(ProbeOutcome::Alive),
            ProbeMode::Lost => Ok(ProbeOutcome::Lost),
            ProbeMode::Fail => Err(Error::probe("connection refused")),
            ProbeMode::Hang => std::future::pending().await,
            ProbeMode::Gated => {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                Ok(ProbeOutcome::Alive)
            }
        }
    }

    fn transport_name(&self) -> &'static str {
        "controlled"
    }
}

/// A presence subscriber whose notifications are pushed by the test
#[derive(Clone, Default)]
pub struct ControlledPresence {
    senders: Arc<Mutex<HashMap<DeviceIdentity, mpsc::UnboundedSender<PresenceEvent>>>>,
    refuse: Arc<AtomicBool>,
    next_handle: Arc<AtomicU64>,
    subscribe_count: Arc<AtomicUsize>,
    unsubscribe_count: Arc<AtomicUsize>,
}

impl ControlledPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent subscriptions fail
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Deliver a presence notification for `device`
    pub fn emit(&self, device: &DeviceIdentity, event: PresenceEvent) {
        if let Some(tx) = self.senders.lock().unwrap().get(device) {
            let _ = tx.send(event);
        }
    }

    /// End the subscription stream of `device` from the network side
    pub fn close(&self, device: &DeviceIdentity) {
        self.senders.lock().unwrap().remove(device);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_count.load(Ordering::SeqCst)
    }
}

impl PresenceSubscriber for ControlledPresence {
    fn subscribe(&self, device: &DeviceIdentity) -> Result<PresenceSubscription> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Other("presence not supported".to_string()));
        }

        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(device.clone(), tx);

        Ok(PresenceSubscription {
            handle: SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)),
            events: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
        })
    }

    fn unsubscribe(&self, device: &DeviceIdentity, _handle: SubscriptionHandle) {
        self.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().remove(device);
    }
}

/// Records every state a callback receives
#[derive(Clone, Default)]
pub struct CallbackRecorder {
    states: Arc<Mutex<Vec<ResourceState>>>,
}

impl CallbackRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(ResourceState) + Send + Sync + 'static {
        let states = Arc::clone(&self.states);
        move |state| states.lock().unwrap().push(state)
    }

    pub fn states(&self) -> Vec<ResourceState> {
        self.states.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn saw(&self, state: ResourceState) -> bool {
        self.states.lock().unwrap().contains(&state)
    }
}

pub fn resource(device_id: &str, uri: &str) -> ResourceIdentity {
    ResourceIdentity::new(device_id, uri, Connectivity::Ip)
}

/// Fast timings, no polling, three retries
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.retry.max_retries = 3;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 40;
    config.probe.timeout_ms = 100;
    config.probe.poll_interval_ms = 0;
    config
}

/// Config whose retries never fire within a test
pub fn slow_retry_config() -> BrokerConfig {
    let mut config = test_config();
    config.retry.initial_backoff_ms = 60_000;
    config.retry.max_backoff_ms = 60_000;
    config
}

pub fn new_broker(
    transport: &ControlledTransport,
    presence: &ControlledPresence,
    config: BrokerConfig,
) -> (ResourceBroker, mpsc::Receiver<BrokerEvent>) {
    ResourceBroker::new(Box::new(transport.clone()), Box::new(presence.clone()), config)
        .expect("broker construction succeeds")
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain every event currently queued
pub fn drain_events(rx: &mut mpsc::Receiver<BrokerEvent>) -> Vec<BrokerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
