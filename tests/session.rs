//! End-to-end session behaviour against the scripted transport.

use std::time::Duration;

use muse_s_link::mock::MockTransport;
use muse_s_link::prelude::*;
use muse_s_link::session::COMMAND_QUEUE_LEN;
use muse_s_link::types::ConnectionState::*;

const ADDR: &str = "00:55:DA:B3:81:73";

const TP9: Channel = Channel::Eeg(Electrode::Tp9);

/// TP9 packet #1; first sample raw 0x7FF.
const EEG_PACKET: [u8; 20] = [
    0x00, 0x01, 0x7F, 0xF0, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x00, 0x08, 0x00,
    0x80, 0x0F, 0xFF, 0x80, 0x08,
];

const VERSION_JSON: &str = r#"{"ap":"headset","sp":"RevE","tp":"consumer","hw":"3.1","bn":27,"fw":"3.4.5","bl":"2.0.1","pv":1,"rc":0}"#;
const STATUS_JSON: &str = r#"{"hn":"MuseS-8173","sn":"4C5A-8173","bp":82,"ts":0,"ps":32,"rc":0}"#;

fn config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy::disabled(),
        ..SessionConfig::default()
    }
}

fn imu_packet(counter: u16, first_x: i16) -> Vec<u8> {
    let mut p = counter.to_be_bytes().to_vec();
    p.extend_from_slice(&first_x.to_be_bytes());
    p.resize(20, 0);
    p
}

fn drained_states(consumer: &Consumer) -> Vec<ConnectionState> {
    std::iter::from_fn(|| consumer.try_recv())
        .filter_map(|e| match e {
            StreamEvent::State(s) => Some(s),
            _ => None,
        })
        .collect()
}

async fn next_event(consumer: &Consumer, pred: impl Fn(&StreamEvent) -> bool) -> StreamEvent {
    let wait = async {
        loop {
            let event = consumer.recv().await.expect("pipeline closed");
            if pred(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("event never arrived")
}

/// Yield until `cond` holds; the spawned session only runs while we yield.
async fn until(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn handshake_runs_both_phases_in_order() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let events = session.consumer();

    session.connect(ADDR).await.unwrap();

    assert_eq!(session.state(), Streaming);
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(mock.disconnect_count(), 1);
    assert_eq!(mock.subscriptions_on(0), [Channel::Control]);
    assert_eq!(mock.commands_on(0), ["h"]);
    assert_eq!(mock.subscriptions_on(1), Channel::REQUIRED);
    assert_eq!(mock.commands_on(1), ["v6", "s", "h", "p21", "d"]);
    assert_eq!(session.subscribed(), Channel::REQUIRED);
    assert_eq!(
        drained_states(&events),
        [PhaseOneConnected, PhaseOneHalted, Disconnected, PhaseTwoConnecting, Streaming]
    );
}

#[tokio::test(start_paused = true)]
async fn aux_subscribes_extra_electrodes_and_preset() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config().with_aux());
    session.connect(ADDR).await.unwrap();

    let subs = mock.subscriptions_on(1);
    assert_eq!(subs.len(), 11);
    assert!(subs.contains(&Channel::Eeg(Electrode::AuxLeft)));
    assert!(subs.contains(&Channel::Eeg(Electrode::Reference)));
    assert_eq!(mock.commands_on(1), ["v6", "s", "h", "p20", "d"]);
}

#[tokio::test(start_paused = true)]
async fn control_only_phase_two_faults_without_retrying() {
    let mock = MockTransport::with_channel_sets(vec![vec![Channel::Control]]);
    let mut session = Session::new(mock.clone(), config());
    let events = session.consumer();

    let err = session.connect(ADDR).await.unwrap_err();
    match err {
        MuseError::HandshakeFailed { missing } => {
            assert_eq!(missing.len(), 7);
            assert!(!missing.contains(&Channel::Control));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), Faulted);
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(drained_states(&events).last(), Some(&Faulted));

    // Faulted is only left by an explicit new connect.
    assert!(matches!(session.run().await, Err(MuseError::NotStreaming(Faulted))));
    assert_eq!(mock.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_subscribe_failures_are_retried() {
    let mock = MockTransport::muse_s();
    mock.fail_next_subscribes(3);
    let mut session = Session::new(mock.clone(), config());
    session.connect(ADDR).await.unwrap();
    assert_eq!(session.state(), Streaming);
}

#[tokio::test(start_paused = true)]
async fn exhausted_write_retries_fault() {
    let mock = MockTransport::muse_s();
    mock.fail_next_writes(4);
    let mut session = Session::new(mock.clone(), config());

    let err = session.connect(ADDR).await.unwrap_err();
    assert!(matches!(err, MuseError::Transport(_)));
    assert_eq!(session.state(), Faulted);
    // Phase one never completed, so no second link was attempted.
    assert_eq!(mock.connect_count(), 1);
    assert_eq!(mock.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connect_faults_and_explicit_connect_recovers() {
    let mock = MockTransport::muse_s();
    mock.fail_next_connects(1);
    let mut session = Session::new(mock.clone(), config());

    assert!(session.connect(ADDR).await.is_err());
    assert_eq!(session.state(), Faulted);

    session.connect(ADDR).await.unwrap();
    assert_eq!(session.state(), Streaming);
    assert_eq!(session.machine().session_id(), 2);
}

#[tokio::test(start_paused = true)]
async fn run_requires_streaming() {
    let mut session = Session::new(MockTransport::muse_s(), config());
    assert!(matches!(
        session.run().await,
        Err(MuseError::NotStreaming(Disconnected))
    ));
}

#[tokio::test(start_paused = true)]
async fn sensor_packets_flow_to_consumers_until_link_drops() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let events = session.consumer();
    session.connect(ADDR).await.unwrap();

    let task = tokio::spawn(async move {
        let end = session.run().await;
        (session, end)
    });

    assert!(mock.notify(TP9, EEG_PACKET.to_vec()));
    assert!(mock.notify(TP9, vec![0x00, 0x02, 0x01]));
    assert!(mock.notify(Channel::Accelerometer, imu_packet(5, 16384)));
    assert!(mock.notify(Channel::Gyroscope, imu_packet(5, -1000)));
    assert!(mock.notify(Channel::Telemetry, vec![0x00, 0x07, 0x1F, 0x40, 0x00, 0x00]));

    let StreamEvent::Eeg(eeg) = next_event(&events, |e| matches!(e, StreamEvent::Eeg(_))).await
    else {
        unreachable!()
    };
    assert_eq!(eeg.channel, TP9);
    assert_eq!(eeg.counter, 1);
    assert_eq!(eeg.samples.len(), EEG_SAMPLES_PER_READING);
    assert!((eeg.samples[0] - -0.48828125).abs() < 1e-9);

    let StreamEvent::Accelerometer(acc) =
        next_event(&events, |e| matches!(e, StreamEvent::Accelerometer(_))).await
    else {
        unreachable!()
    };
    assert_eq!(acc.samples.len(), IMU_SAMPLES_PER_READING);
    assert!((acc.samples[0].x - 1.0).abs() < 1e-3);

    let StreamEvent::Gyroscope(gyro) =
        next_event(&events, |e| matches!(e, StreamEvent::Gyroscope(_))).await
    else {
        unreachable!()
    };
    assert!((gyro.samples[0].x - -7.4768).abs() < 1e-6);

    let StreamEvent::Telemetry(tel) =
        next_event(&events, |e| matches!(e, StreamEvent::Telemetry(_))).await
    else {
        unreachable!()
    };
    assert!((tel.samples[0].battery_percent - 80.0).abs() < 1e-9);

    mock.drop_link();
    let (session, end) = task.await.unwrap();
    assert_eq!(end.unwrap(), SessionEnd::Interrupted);
    assert_eq!(session.state(), Disconnected);
    assert!(session.subscribed().is_empty());

    // The truncated packet was counted, not delivered.
    assert_eq!(session.stats().malformed_packets, 1);
    assert_eq!(session.stats().sensor_packets(), 5);

    let mut ended = Vec::new();
    while let Some(event) = events.try_recv() {
        if let StreamEvent::EndOfStream(ch) = event {
            ended.push(ch);
        }
    }
    assert_eq!(ended, Channel::REQUIRED);
}

#[tokio::test(start_paused = true)]
async fn version_and_status_populate_identity_and_status() {
    let mock = MockTransport::muse_s();
    mock.respond_to("v6", VERSION_JSON);
    mock.respond_to("s", STATUS_JSON);
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();
    let events = session.consumer();
    session.connect(ADDR).await.unwrap();

    let task = tokio::spawn(async move {
        let end = session.run().await;
        (session, end)
    });

    next_event(&events, |e| matches!(e, StreamEvent::Control(r) if r.is_status())).await;
    handle.stop();
    let (session, end) = task.await.unwrap();
    assert_eq!(end.unwrap(), SessionEnd::Stopped);

    let identity = session.identity().unwrap();
    assert_eq!(identity.firmware_version.as_deref(), Some("3.4.5"));
    assert_eq!(identity.hardware_revision.as_deref(), Some("3.1"));
    assert_eq!(identity.bootloader_version.as_deref(), Some("2.0.1"));
    assert_eq!(identity.preset_flags.as_deref(), Some("consumer"));
    assert_eq!(identity.fields["bn"], 27);

    let status = session.status().unwrap();
    assert_eq!(status.battery_percent, Some(82.0));
    assert_eq!(status.fields["ps"], 32);
    assert_eq!(session.stats().control_responses, 2);
}

#[tokio::test(start_paused = true)]
async fn handle_commands_and_stop_send_halt() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();
    let events = session.consumer();
    session.connect(ADDR).await.unwrap();

    let task = tokio::spawn(async move {
        let end = session.run().await;
        (session, end)
    });

    handle.pause().await.unwrap();
    handle.resume().await.unwrap();
    handle.request_status().await.unwrap();
    until(|| mock.commands_on(1).len() == 8).await;
    assert!(matches!(
        handle.send_command("").await,
        Err(MuseError::InvalidCommand { .. })
    ));

    handle.stop();
    let (session, end) = task.await.unwrap();
    assert_eq!(end.unwrap(), SessionEnd::Stopped);
    assert_eq!(session.state(), Disconnected);
    assert_eq!(
        mock.commands_on(1),
        ["v6", "s", "h", "p21", "d", "h", "d", "s", "h"]
    );
    assert_eq!(mock.disconnect_count(), 2);
    assert_eq!(
        next_event(&events, |e| matches!(e, StreamEvent::EndOfStream(_)))
            .await
            .channel(),
        Some(Channel::Control)
    );
}

#[tokio::test(start_paused = true)]
async fn stop_during_handshake_cancels_reconnect() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();

    let task = tokio::spawn(async move {
        let result = session.connect(ADDR).await;
        (session, result)
    });
    until(|| mock.commands_on(0).len() == 1).await;
    handle.stop();

    let (session, result) = task.await.unwrap();
    assert!(matches!(result, Err(MuseError::Stopped)));
    assert_eq!(session.state(), Disconnected);
    assert!(!session.machine().phase_one_complete());
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_policy_bounds_automatic_reconnects() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(
        mock.clone(),
        SessionConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 1,
                delay: Duration::from_millis(50),
            },
            ..SessionConfig::default()
        },
    );
    let events = session.consumer();

    let task = tokio::spawn(async move {
        let end = session.run_with_reconnect(ADDR).await;
        (session, end)
    });

    next_event(&events, |e| matches!(e, StreamEvent::State(Streaming))).await;
    mock.drop_link();
    next_event(&events, |e| matches!(e, StreamEvent::State(Streaming))).await;
    assert_eq!(mock.connect_count(), 4);
    mock.drop_link();

    let (session, end) = task.await.unwrap();
    assert_eq!(end.unwrap(), SessionEnd::Interrupted);
    assert_eq!(session.state(), Disconnected);
    assert_eq!(mock.connect_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn phase_two_subscribe_failures_within_budget_are_retried() {
    let mock = MockTransport::muse_s();
    mock.fail_subscribes_on_link(1, 3);
    let mut session = Session::new(mock.clone(), config());

    session.connect(ADDR).await.unwrap();
    assert_eq!(session.state(), Streaming);
    assert_eq!(mock.subscriptions_on(1), Channel::REQUIRED);
    assert_eq!(mock.commands_on(1), ["v6", "s", "h", "p21", "d"]);
}

#[tokio::test(start_paused = true)]
async fn phase_two_write_failures_within_budget_are_retried() {
    let mock = MockTransport::muse_s();
    mock.fail_writes_on_link(1, 3);
    let mut session = Session::new(mock.clone(), config());

    session.connect(ADDR).await.unwrap();
    assert_eq!(session.state(), Streaming);
    assert_eq!(mock.commands_on(1), ["v6", "s", "h", "p21", "d"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_phase_two_subscribes_fault_and_close_the_link() {
    let mock = MockTransport::muse_s();
    mock.fail_subscribes_on_link(1, 4);
    let mut session = Session::new(mock.clone(), SessionConfig::default());
    let events = session.consumer();

    let err = session.run_with_reconnect(ADDR).await.unwrap_err();
    assert!(matches!(err, MuseError::Transport(_)));
    assert_eq!(session.state(), Faulted);
    assert!(session.subscribed().is_empty());
    assert!(mock.subscriptions_on(1).is_empty());
    assert!(mock.commands_on(1).is_empty());
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(mock.disconnect_count(), 2);
    assert_eq!(drained_states(&events).last(), Some(&Faulted));

    // Faulted never reconnects by itself.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mock.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_phase_two_writes_fault_and_close_the_link() {
    let mock = MockTransport::muse_s();
    mock.fail_writes_on_link(1, 4);
    let mut session = Session::new(mock.clone(), SessionConfig::default());

    let err = session.run_with_reconnect(ADDR).await.unwrap_err();
    assert!(matches!(err, MuseError::Transport(_)));
    assert_eq!(session.state(), Faulted);
    assert!(session.subscribed().is_empty());
    assert_eq!(mock.subscriptions_on(1), Channel::REQUIRED);
    assert!(mock.commands_on(1).is_empty());
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(mock.disconnect_count(), 2);
    assert!(matches!(session.run().await, Err(MuseError::NotStreaming(Faulted))));
    assert_eq!(mock.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_before_connect_is_honoured() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();

    handle.stop();
    assert!(handle.stop_requested());
    assert!(matches!(session.connect(ADDR).await, Err(MuseError::Stopped)));
    assert_eq!(session.state(), Disconnected);
    assert_eq!(mock.connect_count(), 0);
    assert!(!handle.stop_requested());

    // The request is consumed; the next connect goes ahead.
    session.connect(ADDR).await.unwrap();
    assert_eq!(session.state(), Streaming);
}

#[tokio::test(start_paused = true)]
async fn stop_during_discovery_interrupts_it() {
    let mock = MockTransport::muse_s();
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();

    handle.stop();
    assert!(matches!(session.discover().await, Err(MuseError::Stopped)));
    assert_eq!(
        session.run_with_reconnect(ADDR).await.unwrap(),
        SessionEnd::Stopped
    );
    assert_eq!(mock.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_command_queue_fails_instead_of_waiting() {
    let session = Session::new(MockTransport::muse_s(), config());
    let handle = session.handle();

    for _ in 0..COMMAND_QUEUE_LEN {
        handle.pause().await.unwrap();
    }
    assert!(matches!(
        handle.pause().await,
        Err(MuseError::CommandQueueFull)
    ));
}

#[tokio::test(start_paused = true)]
async fn status_with_braces_in_strings() {
    let mock = MockTransport::muse_s();
    mock.respond_to("s", r#"{"hn":"Muse{S}-8173","sn":"}","bp":75,"rc":0}"#);
    let mut session = Session::new(mock.clone(), config());
    let handle = session.handle();
    let events = session.consumer();
    session.connect(ADDR).await.unwrap();

    let task = tokio::spawn(async move {
        let end = session.run().await;
        (session, end)
    });

    next_event(&events, |e| matches!(e, StreamEvent::Control(r) if r.is_status())).await;
    handle.stop();
    let (session, end) = task.await.unwrap();
    assert_eq!(end.unwrap(), SessionEnd::Stopped);

    let status = session.status().unwrap();
    assert_eq!(status.fields["hn"], "Muse{S}-8173");
    assert_eq!(status.fields["sn"], "}");
    assert_eq!(status.battery_percent, Some(75.0));
    assert_eq!(session.stats().invalid_responses, 0);
}
