//! Presence tracking primitives
//!
//! - [`ResourcePresence`]: state machine for one resource
//! - [`DevicePresence`]: subscription and fan-out for one device

pub mod device;
pub(crate) mod notifier;
pub mod resource;

pub use device::{DevicePresence, DeviceState};
pub use resource::{PresenceCallback, ResourcePresence, ResourceSnapshot, ResourceState, Signal};
