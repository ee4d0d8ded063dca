//! Configuration types for the resource broker
//!
//! Retry limits, backoff schedule and probe timing are tuning parameters of a
//! deployment, so every one of them is a field here with a documented default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Retry and backoff policy applied after a loss is detected
    #[serde(default)]
    pub retry: RetryConfig,

    /// Liveness probe settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Device presence subscription settings
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Capacity of the broker event channel
    ///
    /// When full, new broker events are dropped (with a warning log).
    ///
    /// Default: 256 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl BrokerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            probe: ProbeConfig::default(),
            presence: PresenceConfig::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Parse and validate a configuration from JSON
    ///
    /// Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, crate::Error> {
        let config: BrokerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        self.retry.validate()?;
        self.probe.validate()?;
        self.presence.validate()?;

        Ok(())
    }

    /// Retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            poll_interval: match self.probe.poll_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Deadline for a single probe outcome
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    /// Silence on a presence subscription after which it counts as lost
    pub fn presence_timeout(&self) -> Option<Duration> {
        self.presence.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of consecutive losses tolerated before a resource is destroyed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry probe (in milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Factor applied to the delay for every further retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,

    /// Upper bound for the retry delay (in milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.backoff_multiplier == 0 {
            return Err(crate::Error::config("Backoff multiplier must be >= 1"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(crate::Error::config(format!(
                "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Liveness probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Time allowed for a probe outcome before it counts as a timeout (in milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between liveness probes while a resource is alive (in milliseconds)
    ///
    /// Set to 0 to rely on presence notifications only.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ProbeConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.timeout_ms == 0 {
            return Err(crate::Error::config("Probe timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Device presence subscription configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Maximum silence on a device subscription (in milliseconds)
    ///
    /// Devices that announce presence periodically can be declared lost when
    /// they go quiet. `None` disables the check.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PresenceConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.timeout_ms == Some(0) {
            return Err(crate::Error::config("Presence timeout must be > 0 when set"));
        }
        Ok(())
    }
}

/// Resolved retry schedule used by the resource state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
    pub max_backoff: Duration,
    pub poll_interval: Option<Duration>,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    ///
    /// Grows geometrically from `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = delay.saturating_mul(self.backoff_multiplier);
        }
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        BrokerConfig::default().retry_policy()
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_event_channel_capacity() -> usize {
    256
}
