//! Architectural Contract Test: Presence Lifecycle
//!
//! This test verifies the state transitions a monitored resource goes through
//! and the callbacks they produce.
//!
//! Constraints verified:
//! - Reachability is confirmed by a probe or a device announcement, reported once
//! - Device-level loss reaches every resource on the device
//! - Repeated signals never repeat a callback
//! - Exhausted retries report Lost then Destroyed and remove the monitor
//! - A recovered resource resets its retry count
//! - Probe timeouts and transport errors count as loss

mod common;

use broker_core::traits::PresenceEvent;
use broker_core::{BrokerEvent, DeviceState, ResourceState};
use common::*;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test(flavor = "multi_thread")]
async fn alive_then_device_stops_then_cancel() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);
    assert_eq!(assert_ok!(broker.get_resource_state(&light)), ResourceState::Alive);

    presence.emit(&light.device(), PresenceEvent::Stopped);
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);
    assert_eq!(assert_ok!(broker.get_resource_state(&light)), ResourceState::Lost);
    assert_eq!(assert_ok!(broker.device_state(&light.device())), DeviceState::Lost);

    assert_ok!(broker.cancel_host_resource(&light));
    assert!(assert_err!(broker.get_resource_state(&light)).is_not_found());
    assert_eq!(broker.device_count(), 0);
    assert_eq!(presence.unsubscribe_count(), 1);

    assert_eq!(recorder.states(), vec![ResourceState::Alive, ResourceState::Lost]);
}

#[tokio::test(flavor = "multi_thread")]
async fn announcement_confirms_without_probe_answer() {
    let transport = ControlledTransport::new(ProbeMode::Hang);
    let mut config = slow_retry_config();
    config.probe.timeout_ms = 60_000;
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert_eq!(assert_ok!(broker.get_resource_state(&light)), ResourceState::Requested);

    presence.emit(&light.device(), PresenceEvent::Created);
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);
    assert_eq!(assert_ok!(broker.device_state(&light.device())), DeviceState::Alive);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_signals_do_not_repeat_callbacks() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);

    presence.emit(&light.device(), PresenceEvent::Created);
    presence.emit(&light.device(), PresenceEvent::Created);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.states(), vec![ResourceState::Alive]);

    presence.emit(&light.device(), PresenceEvent::Stopped);
    presence.emit(&light.device(), PresenceEvent::Stopped);
    presence.emit(&light.device(), PresenceEvent::Destroyed);
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.states(), vec![ResourceState::Alive, ResourceState::Lost]);
    let snapshot = assert_ok!(broker.resource_snapshot(&light));
    assert_eq!(snapshot.retry_count, 1, "follow-up losses are absorbed by the pending retry");
}

#[tokio::test(flavor = "multi_thread")]
async fn device_loss_reaches_every_resource() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let light_cb = CallbackRecorder::new();
    let fan_cb = CallbackRecorder::new();
    let other_cb = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");
    let fan = resource("dev-1", "/a/fan");
    let other = resource("dev-2", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), light_cb.callback()));
    assert_ok!(broker.host_resource(fan.clone(), fan_cb.callback()));
    assert_ok!(broker.host_resource(other.clone(), other_cb.callback()));
    assert!(wait_for(WAIT, || light_cb.saw(ResourceState::Alive) && fan_cb.saw(ResourceState::Alive)).await);
    assert!(wait_for(WAIT, || other_cb.saw(ResourceState::Alive)).await);

    presence.emit(&light.device(), PresenceEvent::Stopped);
    assert!(wait_for(WAIT, || light_cb.saw(ResourceState::Lost) && fan_cb.saw(ResourceState::Lost)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(other_cb.states(), vec![ResourceState::Alive], "other devices are unaffected");
    assert_eq!(assert_ok!(broker.get_resource_state(&other)), ResourceState::Alive);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_retire_monitor() {
    let transport = ControlledTransport::new(ProbeMode::Lost);
    let presence = ControlledPresence::new();
    let config = test_config();
    let max_retries = config.retry.max_retries;
    let (broker, mut events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Destroyed)).await);
    assert!(wait_for(WAIT, || broker.device_count() == 0).await);

    assert_eq!(recorder.states(), vec![ResourceState::Lost, ResourceState::Destroyed]);
    assert_eq!(transport.probe_count(), max_retries as usize + 1);
    assert!(assert_err!(broker.get_resource_state(&light)).is_not_found());
    assert_eq!(presence.unsubscribe_count(), 1);

    let emitted = drain_events(&mut events);
    assert!(emitted.contains(&BrokerEvent::ResourceRetired {
        identity: light.clone(),
        retries: max_retries + 1,
    }));

    // A retired resource can be hosted again
    transport.set_mode(ProbeMode::Alive);
    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.count() == 3).await);
    assert_eq!(recorder.states()[2], ResourceState::Alive);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_resets_retry_count() {
    let transport = ControlledTransport::new(ProbeMode::Lost);
    let presence = ControlledPresence::new();
    let mut config = test_config();
    config.retry.initial_backoff_ms = 100;
    config.retry.max_backoff_ms = 100;
    let (broker, _events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);

    transport.set_mode(ProbeMode::Alive);
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);

    assert_eq!(recorder.states(), vec![ResourceState::Lost, ResourceState::Alive]);
    let snapshot = assert_ok!(broker.resource_snapshot(&light));
    assert_eq!(snapshot.state, ResourceState::Alive);
    assert_eq!(snapshot.retry_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_timeout_counts_as_loss() {
    let transport = ControlledTransport::new(ProbeMode::Hang);
    let presence = ControlledPresence::new();
    let mut config = test_config();
    config.retry.max_retries = 0;
    config.probe.timeout_ms = 30;
    let (broker, _events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();

    assert_ok!(broker.host_resource(resource("dev-1", "/a/light"), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Destroyed)).await);
    assert_eq!(recorder.states(), vec![ResourceState::Lost, ResourceState::Destroyed]);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_error_counts_as_loss() {
    let transport = ControlledTransport::new(ProbeMode::Fail);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);
    assert_eq!(assert_ok!(broker.get_resource_state(&light)), ResourceState::Lost);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_triggers_reprobe() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);
    let probes = transport.probe_count();

    presence.emit(&light.device(), PresenceEvent::Updated);
    assert!(wait_for(WAIT, || transport.probe_count() > probes).await);
    assert!(
        wait_for(WAIT, || broker.get_resource_state(&light).ok() == Some(ResourceState::Alive)).await
    );

    // The re-arm itself is silent; the confirming probe reports once
    assert!(wait_for(WAIT, || recorder.count() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.states(), vec![ResourceState::Alive, ResourceState::Alive]);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_end_is_device_loss() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let (broker, _events) = new_broker(&transport, &presence, slow_retry_config());
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Alive)).await);

    presence.close(&light.device());
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);
    assert_eq!(assert_ok!(broker.device_state(&light.device())), DeviceState::Lost);
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_subscription_reports_loss_once_per_quiet_period() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let mut config = test_config();
    config.presence.timeout_ms = Some(50);
    let (broker, _events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();
    let light = resource("dev-1", "/a/light");

    assert_ok!(broker.host_resource(light.clone(), recorder.callback()));

    // Silence is one loss; the retry confirms the resource again
    assert!(wait_for(WAIT, || recorder.count() == 3).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        recorder.states(),
        vec![ResourceState::Alive, ResourceState::Lost, ResourceState::Alive]
    );
    assert_eq!(assert_ok!(broker.device_state(&light.device())), DeviceState::Lost);

    // Traffic ends the quiet period; the next one is a new loss
    presence.emit(&light.device(), PresenceEvent::Created);
    assert!(wait_for(WAIT, || recorder.count() == 5).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        recorder.states(),
        vec![
            ResourceState::Alive,
            ResourceState::Lost,
            ResourceState::Alive,
            ResourceState::Lost,
            ResourceState::Alive,
        ]
    );
    assert_eq!(assert_ok!(broker.get_resource_state(&light)), ResourceState::Alive);
}

#[tokio::test(flavor = "multi_thread")]
async fn alive_resource_is_polled() {
    let transport = ControlledTransport::new(ProbeMode::Alive);
    let presence = ControlledPresence::new();
    let mut config = slow_retry_config();
    config.probe.poll_interval_ms = 20;
    let (broker, _events) = new_broker(&transport, &presence, config);
    let recorder = CallbackRecorder::new();

    assert_ok!(broker.host_resource(resource("dev-1", "/a/light"), recorder.callback()));
    assert!(wait_for(WAIT, || transport.probe_count() >= 3).await);
    assert_eq!(recorder.states(), vec![ResourceState::Alive]);

    transport.set_mode(ProbeMode::Lost);
    assert!(wait_for(WAIT, || recorder.saw(ResourceState::Lost)).await);
    assert_eq!(recorder.states(), vec![ResourceState::Alive, ResourceState::Lost]);
}
