// # broker-core
//
// Presence and liveness tracking for resources hosted on devices of an
// unreliable network.
//
// ## Architecture Overview
//
// - **ProbeTransport**: Trait for sending liveness probes to a resource
// - **PresenceSubscriber**: Trait for device-level presence subscriptions
// - **ResourcePresence**: State machine tracking one resource
// - **DevicePresence**: One subscription per device, fanning signals out to its resources
// - **ResourceBroker**: Explicitly owned façade hosting and cancelling monitors
//
// ## Design Principles
//
// 1. **One monitor per resource**: hosting twice is an error, not a second monitor
// 2. **One subscription per device**: shared by every resource on the device
// 3. **Callbacks outside locks**: delivered on a dedicated notification thread
// 4. **Cancellation is final**: no callback runs after cancel returns
// 5. **Library-First**: no globals; the application owns the broker

pub mod broker;
pub mod config;
pub mod error;
pub mod identity;
pub mod presence;
pub mod traits;

// Re-export core types for convenience
pub use broker::{BrokerEvent, ResourceBroker};
pub use config::{BrokerConfig, PresenceConfig, ProbeConfig, RetryConfig, RetryPolicy};
pub use error::{Error, Result};
pub use identity::{Connectivity, DeviceIdentity, ResourceIdentity};
pub use presence::{
    DevicePresence, DeviceState, ResourcePresence, ResourceSnapshot, ResourceState, Signal,
};
pub use traits::{PresenceEvent, PresenceSubscriber, ProbeOutcome, ProbeTransport};
