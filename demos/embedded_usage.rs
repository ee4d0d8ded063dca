//! Minimal embedding example for broker-core
//!
//! This example hosts a few resources on a simulated device network and
//! walks them through discovery, device loss, recovery and retirement. The
//! broker lifecycle is fully managed by the application.
//!
//! Usage: `embedded_usage [config.json] [log-level]`

use anyhow::{Context, Result};
use broker_core::traits::{
    PresenceEvent, PresenceSubscriber, PresenceSubscription, ProbeOutcome, ProbeTransport,
    SubscriptionHandle,
};
use broker_core::{
    BrokerConfig, Connectivity, DeviceIdentity, ResourceBroker, ResourceIdentity, ResourceState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Shared view of which devices currently answer
#[derive(Clone, Default)]
struct Network {
    reachable: Arc<Mutex<HashSet<String>>>,
    presence: Arc<Mutex<HashMap<DeviceIdentity, mpsc::UnboundedSender<PresenceEvent>>>>,
}

impl Network {
    fn set_reachable(&self, device: &DeviceIdentity, reachable: bool) {
        {
            let mut set = self.reachable.lock().unwrap_or_else(|e| e.into_inner());
            if reachable {
                set.insert(device.device_id.clone());
            } else {
                set.remove(&device.device_id);
            }
        }

        let event = if reachable {
            PresenceEvent::Created
        } else {
            PresenceEvent::Stopped
        };
        let presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = presence.get(device) {
            let _ = tx.send(event);
        }
    }

    fn is_reachable(&self, device_id: &str) -> bool {
        self.reachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }
}

/// Probe transport answering from the simulated network
struct SimulatedTransport {
    network: Network,
    latency: Duration,
}

#[async_trait::async_trait]
impl ProbeTransport for SimulatedTransport {
    async fn send_probe(&self, identity: &ResourceIdentity) -> broker_core::Result<ProbeOutcome> {
        tokio::time::sleep(self.latency).await;
        if self.network.is_reachable(&identity.device_id) {
            Ok(ProbeOutcome::Alive)
        } else {
            Ok(ProbeOutcome::Lost)
        }
    }

    fn transport_name(&self) -> &'static str {
        "simulated"
    }
}

/// Presence subscriber fed by the simulated network
struct SimulatedPresence {
    network: Network,
    next_handle: AtomicU64,
}

impl PresenceSubscriber for SimulatedPresence {
    fn subscribe(&self, device: &DeviceIdentity) -> broker_core::Result<PresenceSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network
            .presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.clone(), tx);

        Ok(PresenceSubscription {
            handle: SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)),
            events: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
        })
    }

    fn unsubscribe(&self, device: &DeviceIdentity, _handle: SubscriptionHandle) {
        self.network
            .presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device);
    }
}

fn load_config(path: Option<&str>) -> Result<BrokerConfig> {
    let Some(path) = path else {
        let mut config = BrokerConfig::default();
        config.retry.max_retries = 2;
        config.retry.initial_backoff_ms = 200;
        config.retry.max_backoff_ms = 800;
        config.probe.timeout_ms = 500;
        config.probe.poll_interval_ms = 1_000;
        return Ok(config);
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    BrokerConfig::from_json(&raw).with_context(|| format!("invalid config file {}", path))
}

fn reporter(identity: &ResourceIdentity) -> impl Fn(ResourceState) + Send + Sync + 'static {
    let label = identity.to_string();
    move |state| println!("[Callback] {} -> {:?}", label, state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let log_level = match args.get(1).map(|s| s.to_lowercase()).as_deref() {
        Some("trace") => Level::TRACE,
        Some("debug") => Level::DEBUG,
        Some("warn") => Level::WARN,
        Some("error") => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = load_config(args.first().map(String::as_str))?;

    println!("=== Embedded broker-core Example ===\n");

    let network = Network::default();
    let lamp = DeviceIdentity::new("lamp-01", Connectivity::Ip);
    let sensor = DeviceIdentity::new("sensor-07", Connectivity::Tcp);
    network.set_reachable(&lamp, true);

    let transport = SimulatedTransport {
        network: network.clone(),
        latency: Duration::from_millis(20),
    };
    let presence = SimulatedPresence {
        network: network.clone(),
        next_handle: AtomicU64::new(1),
    };

    println!("1. Creating broker...");
    let (broker, mut event_rx) =
        ResourceBroker::new(Box::new(transport), Box::new(presence), config)?;

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    println!("2. Hosting resources...");
    let light = ResourceIdentity::new("lamp-01", "/a/light", Connectivity::Ip);
    let dimmer = ResourceIdentity::new("lamp-01", "/a/dimmer", Connectivity::Ip);
    let temperature = ResourceIdentity::new("sensor-07", "/a/temperature", Connectivity::Tcp);
    for identity in [&light, &dimmer, &temperature] {
        broker.host_resource(identity.clone(), reporter(identity))?;
    }
    if let Err(e) = broker.host_resource(light.clone(), reporter(&light)) {
        println!("   Second host of {} rejected: {}", light, e);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n3. {} goes offline...", lamp);
    network.set_reachable(&lamp, false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("Device {} is {:?}", lamp, broker.device_state(&lamp)?);

    println!("\n4. {} comes back...", lamp);
    network.set_reachable(&lamp, true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    for identity in [&light, &dimmer] {
        let snapshot = broker.resource_snapshot(identity)?;
        println!(
            "   {} is {:?} since {} (retries: {})",
            snapshot.identity, snapshot.state, snapshot.last_transition, snapshot.retry_count
        );
    }

    println!("\n5. Cancelling {}...", dimmer);
    broker.cancel_host_resource(&dimmer)?;

    println!("\n6. Waiting for {} to be retired...", sensor);
    tokio::time::sleep(Duration::from_secs(2)).await;
    match broker.get_resource_state(&temperature) {
        Ok(state) => println!("   {} still monitored ({:?})", temperature, state),
        Err(e) => println!("   {}: {}", temperature, e),
    }

    println!(
        "\n7. Shutting down ({} devices, {} resources monitored)...",
        broker.device_count(),
        broker.resource_count()
    );
    drop(broker);
    let _ = tokio::time::timeout(Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Broker lifecycle is fully controlled by application");
    println!("- No global state");
    println!("- Transport and presence are custom implementations");

    Ok(())
}
