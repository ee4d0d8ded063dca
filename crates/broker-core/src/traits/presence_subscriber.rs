// # Presence Subscriber Trait
//
// Defines the interface for device-level presence subscriptions.
//
// A device announces its own state changes (started, updated, stopped). One
// subscription per device serves every monitored resource on it.
//
// ## Usage
//
// ```rust,ignore
// use broker_core::traits::PresenceSubscriber;
// use tokio_stream::StreamExt;
//
// let subscriber = /* PresenceSubscriber implementation */;
// let mut subscription = subscriber.subscribe(&device)?;
// while let Some(event) = subscription.events.next().await {
//     println!("presence: {:?}", event);
// }
// subscriber.unsubscribe(&device, subscription.handle);
// ```

use std::fmt;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::identity::DeviceIdentity;

/// Presence notification delivered for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Device announced itself (presence "ON")
    Created,
    /// Device is about to change state; resources should be re-checked
    Updated,
    /// Device stopped announcing (presence "OFF")
    Stopped,
    /// Device announced it is going away
    Destroyed,
    /// The collaborator gave up waiting for presence traffic
    Timeout,
}

/// Opaque handle identifying one presence subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Stream of presence notifications for one device
pub type PresenceStream = Pin<Box<dyn Stream<Item = PresenceEvent> + Send + 'static>>;

/// An established presence subscription
pub struct PresenceSubscription {
    /// Handle to pass back to [`PresenceSubscriber::unsubscribe`]
    pub handle: SubscriptionHandle,
    /// Notifications for the device
    ///
    /// The end of the stream means the subscription is gone; the broker
    /// treats it as a device-wide loss.
    pub events: PresenceStream,
}

impl fmt::Debug for PresenceSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSubscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Trait for presence subscription implementations
///
/// # Behavior
///
/// - `subscribe` submits the subscription and returns immediately; it must
///   not wait for network round trips
/// - `unsubscribe` is called exactly once per successful `subscribe`, while
///   the broker holds its registry lock, so it must not block or call back
///   into the broker
/// - Dropping the event stream must be safe at any point
pub trait PresenceSubscriber: Send + Sync {
    /// Start a presence subscription for `device`
    ///
    /// # Returns
    ///
    /// - `Ok(PresenceSubscription)`: subscription submitted
    /// - `Err(Error)`: the subscription could not be established
    fn subscribe(&self, device: &DeviceIdentity) -> Result<PresenceSubscription, crate::Error>;

    /// Tear down a subscription previously returned by `subscribe`
    fn unsubscribe(&self, device: &DeviceIdentity, handle: SubscriptionHandle);
}
