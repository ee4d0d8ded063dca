// # Probe Transport Trait
//
// Defines the interface for sending liveness probes to a resource.
//
// The transport owns the request/response exchange (encoding, retransmission,
// congestion handling). The broker only sees the outcome.
//
// ## Usage
//
// ```rust,ignore
// use broker_core::traits::{ProbeTransport, ProbeOutcome};
//
// let transport = /* ProbeTransport implementation */;
// match transport.send_probe(&identity).await? {
//     ProbeOutcome::Alive => println!("reachable"),
//     ProbeOutcome::Lost => println!("gone"),
// }
// ```

use async_trait::async_trait;

use crate::identity::ResourceIdentity;

/// Outcome of a completed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The resource answered
    Alive,
    /// The transport got a definitive "not there" answer
    Lost,
}

/// Trait for liveness probe transports
///
/// # Behavior
///
/// - `send_probe` resolves once per probe with the outcome of that single
///   exchange
/// - Transport-level failures are reported as `Err`; the broker treats them
///   as a probe error and applies its retry policy
/// - A transport that enforces its own deadline reports it as
///   `Error::ProbeTimeout`
/// - Implementations do not need to enforce a deadline: the broker wraps
///   every call in its configured probe timeout and drops the future when it
///   expires, so the future must be cancellation-safe
///
/// # Forbidden
///
/// - ❌ Retrying on behalf of the broker (retry policy lives in the broker)
/// - ❌ Calling back into the broker from `send_probe`
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Send one liveness probe to `identity` and wait for its outcome
    async fn send_probe(&self, identity: &ResourceIdentity) -> Result<ProbeOutcome, crate::Error>;

    /// Short name used in logs
    fn transport_name(&self) -> &'static str {
        "transport"
    }
}
