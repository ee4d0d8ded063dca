//! Collaborator traits for the resource broker
//!
//! This module defines the interfaces the broker consumes from the network
//! side. Payload encoding and transport retries live behind them.
//!
//! - [`ProbeTransport`]: Send liveness probes to a resource
//! - [`PresenceSubscriber`]: Subscribe to device-level presence notifications

pub mod presence_subscriber;
pub mod probe_transport;

pub use presence_subscriber::{
    PresenceEvent, PresenceStream, PresenceSubscriber, PresenceSubscription, SubscriptionHandle,
};
pub use probe_transport::{ProbeOutcome, ProbeTransport};
