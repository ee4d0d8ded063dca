//! Per-resource presence state machine
//!
//! ## States
//!
//! ```text
//!  NotMonitored ──arm──▶ Requested ──confirm──▶ Alive
//!                            │  ▲                 │
//!                            │  └────updated──────┤
//!                          loss                 loss
//!                            ▼                    ▼
//!                          Lost ◀──retry probe──▶ (backoff)
//!                            │
//!                 retries exhausted / cancel
//!                            ▼
//!                        Destroyed
//! ```
//!
//! Transitions never run I/O. They return [`Effect`]s (probe, timer,
//! retirement) that the broker executes after every lock is released, and they
//! enqueue callback notifications while the entry lock is held so callbacks
//! observe transitions in order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use super::notifier::Notifier;
use crate::config::RetryPolicy;
use crate::identity::ResourceIdentity;
use crate::traits::{PresenceEvent, ProbeOutcome};

/// Lifecycle state of a monitored resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Entry constructed but not armed yet
    NotMonitored,
    /// A probe or subscription is outstanding, reachability unknown
    Requested,
    /// Reachability confirmed
    Alive,
    /// Loss detected, retry in progress
    Lost,
    /// Terminal: cancelled or retries exhausted
    Destroyed,
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ProbeAlive,
    ProbeLost,
    ProbeError,
    ProbeTimeout,
    PresenceCreated,
    PresenceUpdated,
    PresenceStopped,
    PresenceDestroyed,
    /// The device subscription ended or went silent
    SubscriptionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalClass {
    Confirm,
    Refresh,
    Loss,
}

impl Signal {
    fn class(self) -> SignalClass {
        match self {
            Signal::ProbeAlive | Signal::PresenceCreated => SignalClass::Confirm,
            Signal::PresenceUpdated => SignalClass::Refresh,
            Signal::ProbeLost
            | Signal::ProbeError
            | Signal::ProbeTimeout
            | Signal::PresenceStopped
            | Signal::PresenceDestroyed
            | Signal::SubscriptionLost => SignalClass::Loss,
        }
    }
}

impl From<ProbeOutcome> for Signal {
    fn from(outcome: ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Alive => Signal::ProbeAlive,
            ProbeOutcome::Lost => Signal::ProbeLost,
        }
    }
}

impl From<PresenceEvent> for Signal {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::Created => Signal::PresenceCreated,
            PresenceEvent::Updated => Signal::PresenceUpdated,
            PresenceEvent::Stopped => Signal::PresenceStopped,
            PresenceEvent::Destroyed => Signal::PresenceDestroyed,
            PresenceEvent::Timeout => Signal::SubscriptionLost,
        }
    }
}

/// Handler invoked on every reported transition
pub type PresenceCallback = Arc<dyn Fn(ResourceState) + Send + Sync + 'static>;

/// Work requested by a transition, executed outside all locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Send probe number `seq`
    Probe { seq: u64 },
    /// Arm the entry timer; it fires `on_timer(generation)` after `delay`
    Schedule { delay: Duration, generation: u64 },
    /// Retries exhausted, remove the entry from its device
    Retire,
}

/// Result of feeding one input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) from: ResourceState,
    pub(crate) to: ResourceState,
    pub(crate) effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: ResourceState) -> Self {
        Self {
            from: state,
            to: state,
            effects: Vec::new(),
        }
    }
}

/// Point-in-time view of a monitored resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub identity: ResourceIdentity,
    pub state: ResourceState,
    pub retry_count: u32,
    pub last_transition: DateTime<Utc>,
}

struct Inner {
    state: ResourceState,
    retry_count: u32,
    probe_seq: u64,
    outstanding_probe: Option<u64>,
    timer_generation: u64,
    timer_armed: bool,
    timer: Option<AbortHandle>,
    cancelled: bool,
    /// Thread currently running the callback, if any
    delivering: Option<ThreadId>,
    last_transition: DateTime<Utc>,
}

impl Inner {
    fn enter(&mut self, state: ResourceState) {
        self.state = state;
        self.last_transition = Utc::now();
    }

    fn issue_probe(&mut self) -> Effect {
        self.probe_seq += 1;
        self.outstanding_probe = Some(self.probe_seq);
        Effect::Probe { seq: self.probe_seq }
    }

    fn schedule(&mut self, delay: Duration) -> Effect {
        self.invalidate_timer();
        self.timer_armed = true;
        Effect::Schedule {
            delay,
            generation: self.timer_generation,
        }
    }

    fn invalidate_timer(&mut self) {
        self.timer_generation += 1;
        self.timer_armed = false;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// A loss is already being worked on by a backoff timer or a retry probe
    fn retry_pending(&self) -> bool {
        self.state == ResourceState::Lost && (self.timer_armed || self.outstanding_probe.is_some())
    }
}

/// Presence tracking for a single resource
///
/// Owned by its [`DevicePresence`](super::DevicePresence). All mutation goes
/// through the entry lock; callbacks run on the notifier thread with the lock
/// released, and `idle` wakes cancellers waiting for such a callback to end.
pub struct ResourcePresence {
    identity: ResourceIdentity,
    callback: PresenceCallback,
    policy: RetryPolicy,
    notifier: Notifier,
    inner: Mutex<Inner>,
    idle: Condvar,
}

impl ResourcePresence {
    /// Create an entry in `Requested` and request its first probe
    pub(crate) fn arm(
        identity: ResourceIdentity,
        callback: PresenceCallback,
        policy: RetryPolicy,
        notifier: Notifier,
    ) -> (Arc<Self>, Transition) {
        let entry = Arc::new(Self {
            identity,
            callback,
            policy,
            notifier,
            inner: Mutex::new(Inner {
                state: ResourceState::NotMonitored,
                retry_count: 0,
                probe_seq: 0,
                outstanding_probe: None,
                timer_generation: 0,
                timer_armed: false,
                timer: None,
                cancelled: false,
                delivering: None,
                last_transition: Utc::now(),
            }),
            idle: Condvar::new(),
        });

        let transition = {
            let mut inner = entry.lock();
            inner.enter(ResourceState::Requested);
            let probe = inner.issue_probe();
            Transition {
                from: ResourceState::NotMonitored,
                to: ResourceState::Requested,
                effects: vec![probe],
            }
        };

        debug!("Armed presence for {}", entry.identity);
        (entry, transition)
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Last confirmed state, without side effects
    pub fn current_state(&self) -> ResourceState {
        self.lock().state
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let inner = self.lock();
        ResourceSnapshot {
            identity: self.identity.clone(),
            state: inner.state,
            retry_count: inner.retry_count,
            last_transition: inner.last_transition,
        }
    }

    /// Feed a presence signal into the state machine
    pub(crate) fn on_signal(self: &Arc<Self>, signal: Signal) -> Transition {
        let mut inner = self.lock();
        self.apply(&mut inner, signal)
    }

    /// Feed the outcome of probe `seq`
    ///
    /// Outcomes of superseded probes are discarded.
    pub(crate) fn on_probe_outcome(self: &Arc<Self>, seq: u64, signal: Signal) -> Transition {
        let mut inner = self.lock();
        if inner.outstanding_probe != Some(seq) {
            debug!("Discarding stale probe #{} ({:?}) for {}", seq, signal, self.identity);
            return Transition::unchanged(inner.state);
        }
        inner.outstanding_probe = None;
        self.apply(&mut inner, signal)
    }

    /// Handle expiry of the timer armed with `generation`
    pub(crate) fn on_timer(&self, generation: u64) -> Transition {
        let mut inner = self.lock();
        if inner.cancelled
            || inner.state == ResourceState::Destroyed
            || !inner.timer_armed
            || inner.timer_generation != generation
        {
            return Transition::unchanged(inner.state);
        }

        inner.timer_armed = false;
        inner.timer = None;
        let probe = inner.issue_probe();
        debug!(
            "Timer fired for {} in {:?}, probing (retry {})",
            self.identity, inner.state, inner.retry_count
        );
        Transition {
            from: inner.state,
            to: inner.state,
            effects: vec![probe],
        }
    }

    /// Record the task backing timer `generation`
    ///
    /// A handle that arrives after the timer was superseded or the entry was
    /// cancelled is aborted immediately.
    pub(crate) fn attach_timer(&self, generation: u64, timer: AbortHandle) {
        let mut inner = self.lock();
        if !inner.cancelled && inner.timer_armed && inner.timer_generation == generation {
            inner.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Move to `Destroyed` and stop all further callbacks
    ///
    /// Pending timers are aborted and outstanding probes forgotten. A callback
    /// already running on the notifier thread may still be finishing; pair
    /// with [`wait_for_delivery`](Self::wait_for_delivery) once no broker lock
    /// is held.
    pub(crate) fn cancel(&self) {
        let mut inner = self.lock();
        inner.cancelled = true;
        inner.outstanding_probe = None;
        inner.invalidate_timer();
        if inner.state != ResourceState::Destroyed {
            inner.enter(ResourceState::Destroyed);
        }
        debug!("Cancelled presence for {}", self.identity);
    }

    /// Block until no callback for this entry is running
    ///
    /// Returns immediately when called from inside this entry's own callback.
    pub(crate) fn wait_for_delivery(&self) {
        let me = thread::current().id();
        let mut inner = self.lock();
        while let Some(thread) = inner.delivering {
            if thread == me {
                break;
            }
            inner = self.idle.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Run the callback for `state` unless the entry was cancelled
    ///
    /// Called on the notifier thread only.
    pub(crate) fn deliver(&self, state: ResourceState) {
        {
            let mut inner = self.lock();
            if inner.cancelled {
                debug!("Suppressing {:?} callback for cancelled {}", state, self.identity);
                return;
            }
            inner.delivering = Some(thread::current().id());
        }

        let callback = Arc::clone(&self.callback);
        if panic::catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
            error!("Presence callback for {} panicked on {:?}", self.identity, state);
        }

        self.lock().delivering = None;
        self.idle.notify_all();
    }

    fn apply(self: &Arc<Self>, inner: &mut Inner, signal: Signal) -> Transition {
        let from = inner.state;
        if matches!(from, ResourceState::Destroyed | ResourceState::NotMonitored) {
            return Transition::unchanged(from);
        }

        let mut effects = Vec::new();
        match signal.class() {
            SignalClass::Confirm => {
                inner.retry_count = 0;
                inner.invalidate_timer();
                if let Some(interval) = self.policy.poll_interval {
                    effects.push(inner.schedule(interval));
                }
                if from != ResourceState::Alive {
                    inner.enter(ResourceState::Alive);
                    self.notify(ResourceState::Alive);
                }
            }
            SignalClass::Refresh => {
                if from == ResourceState::Alive {
                    inner.invalidate_timer();
                    effects.push(inner.issue_probe());
                    inner.enter(ResourceState::Requested);
                }
            }
            SignalClass::Loss => {
                if inner.retry_pending() {
                    debug!("{:?} for {} absorbed, retry already pending", signal, self.identity);
                    return Transition::unchanged(from);
                }

                inner.retry_count += 1;
                inner.invalidate_timer();
                if from != ResourceState::Lost {
                    self.notify(ResourceState::Lost);
                }

                if inner.retry_count > self.policy.max_retries {
                    inner.outstanding_probe = None;
                    inner.enter(ResourceState::Destroyed);
                    self.notify(ResourceState::Destroyed);
                    effects.push(Effect::Retire);
                    info!(
                        "{} lost after {} attempts, giving up",
                        self.identity, inner.retry_count
                    );
                } else {
                    inner.enter(ResourceState::Lost);
                    let delay = self.policy.backoff(inner.retry_count);
                    effects.push(inner.schedule(delay));
                    debug!(
                        "{} lost on {:?}, retry {} in {:?}",
                        self.identity, signal, inner.retry_count, delay
                    );
                }
            }
        }

        if inner.state != from {
            debug!("{}: {:?} -> {:?} on {:?}", self.identity, from, inner.state, signal);
        }

        Transition {
            from,
            to: inner.state,
            effects,
        }
    }

    fn notify(self: &Arc<Self>, state: ResourceState) {
        self.notifier.enqueue(Arc::clone(self), state);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ResourcePresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePresence")
            .field("identity", &self.identity)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}
