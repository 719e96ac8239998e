use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use lib_panopticon::core::ErrorKind;
use lib_panopticon::protocol::{CanFrameKind, CanRecord};
use lib_panopticon::{AppContext, Channel, ChannelValue, ManagedService, PanopticonSettings};
use project_tests::{AfterScript, DeviceServer, MemoryConnector, closed_port_uri, wait_until};

fn settings(uri: String) -> PanopticonSettings {
    let mut settings = PanopticonSettings {
        batch_interval_ms: 50,
        ..PanopticonSettings::default()
    };
    settings.lighthouse.uri = uri;
    settings.lighthouse.reconnect_interval_ms = 200;
    settings.lighthouse.reconnect_max_delay_ms = 200;
    settings.lighthouse.read_timeout_ms = 100;
    settings
}

fn context(settings: PanopticonSettings) -> Arc<AppContext<MemoryConnector>> {
    let codec = Arc::new(lib_panopticon::protocol::FixedLayoutCodec::new(
        settings.lighthouse.state_sizes,
    ));
    Arc::new(AppContext::with_connectors(
        settings,
        codec,
        MemoryConnector::new(),
        MemoryConnector::new(),
    ))
}

fn can_frame(id: u32, data: &[u8]) -> Vec<u8> {
    CanRecord::new(CanFrameKind::Classic, id, data, Utc::now())
        .expect("valid CAN record")
        .encode_frame()
}

#[tokio::test]
async fn test_frames_reach_subscribers_through_the_batching_layer() {
    let script = vec![
        can_frame(0x101, &[1, 2, 3]),
        vec![9, 9, 9],
        can_frame(0x102, &[4]),
        vec![1, 0xDE, 0xAD],
    ];
    let device = DeviceServer::start(script, AfterScript::Hold).await;
    let ctx = context(settings(device.uri()));
    let client = ctx.initialize_lighthouse().await;

    let can_ids = Arc::new(Mutex::new(Vec::<Vec<u32>>::new()));
    let sink = Arc::clone(&can_ids);
    ctx.register(Channel::CanFrames, move |value| {
        if let ChannelValue::CanFrames(window) = value {
            sink.lock().unwrap().push(window.iter().map(|r| r.id).collect());
        }
        Ok(())
    })
    .await
    .expect("link initialized");

    let states = Arc::new(Mutex::new(Vec::new()));
    let state_sink = Arc::clone(&states);
    ctx.register(Channel::State, move |value| {
        if let ChannelValue::State(snapshot) = value {
            state_sink.lock().unwrap().push(snapshot.raw.to_vec());
        }
        Ok(())
    })
    .await
    .expect("link initialized");

    client.start();

    let delivered = wait_until(Duration::from_secs(3), || {
        can_ids.lock().unwrap().last() == Some(&vec![0x101, 0x102]) && !states.lock().unwrap().is_empty()
    })
    .await;
    assert!(delivered, "frames were not delivered: {:?}", can_ids.lock().unwrap());
    assert_eq!(states.lock().unwrap()[0], vec![0xDE, 0xAD]);

    let status = client.status();
    assert!(status.connected);
    assert_eq!(status.error, ErrorKind::NoError);
    // The unknown tag 9 is neither decoded nor counted.
    assert_eq!(status.messages_received, 3);
    assert_eq!(status.bytes_received, 10 + 8 + 3);

    ctx.stop_all().await;
    assert!(!client.status().connected);
}

#[tokio::test]
async fn test_remote_close_marks_connection_lost_and_reconnects() {
    let device = DeviceServer::start(vec![can_frame(0x7FF, &[])], AfterScript::Close).await;
    let ctx = context(settings(device.uri()));
    let client = ctx.initialize_lighthouse().await;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    ctx.register(Channel::WebsocketStatus, move |value| {
        if let ChannelValue::LinkStatus(status) = value {
            sink.lock().unwrap().push(status.clone());
        }
        Ok(())
    })
    .await
    .expect("link initialized");
    client.start();

    assert!(wait_until(Duration::from_secs(3), || device.connections() >= 2).await);
    assert!(wait_until(Duration::from_secs(1), || {
        statuses
            .lock()
            .unwrap()
            .iter()
            .any(|s| !s.connected && s.error == ErrorKind::ConnectionLost)
    })
    .await);

    ctx.stop_all().await;
}

#[tokio::test]
async fn test_refused_connection_is_retried_without_failing() {
    let ctx = context(settings(closed_port_uri().await));
    let client = ctx.initialize_lighthouse().await;
    client.start();

    assert!(wait_until(Duration::from_secs(3), || client.status().reconnect_attempts >= 2).await);
    let status = client.status();
    assert!(!status.connected);
    assert_eq!(status.error, ErrorKind::ConnectionRefused);
    assert!(status.last_error.is_some());
    assert!(status.last_connected.is_none());

    // Starting twice only warns.
    client.start();
    assert!(client.is_running());

    ctx.stop_all().await;
    assert!(!client.is_running());
}
