use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_panopticon::core::{Dispatcher, ErrorKind, ManagedService};
use lib_panopticon::ingestors::LighthouseClient;
use lib_panopticon::protocol::FixedLayoutCodec;
use lib_panopticon::LighthouseSettings;
use tokio::net::TcpListener;
use tokio::time::Instant;

/// Accepts TCP connections and drops them at once, so every handshake fails.
async fn dropping_listener() -> (String, Arc<Mutex<Vec<Instant>>>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("ws://{}", listener.local_addr().unwrap());
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&accepted);
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            log.lock().unwrap().push(Instant::now());
            drop(stream);
        }
    });
    (uri, accepted, handle)
}

#[tokio::test]
async fn test_attempts_are_never_closer_than_min_interval() {
    let (uri, accepted, server) = dropping_listener().await;
    let settings = LighthouseSettings {
        uri,
        reconnect_interval_ms: 250,
        reconnect_max_delay_ms: 250,
        ..LighthouseSettings::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let client = LighthouseClient::new(settings, Arc::new(FixedLayoutCodec::default()), dispatcher);
    client.start();

    // Collect every attempt start the client reports.
    let mut attempts: Vec<Instant> = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(1400);
    while Instant::now() < deadline {
        if let Some(at) = client.status().last_attempt {
            if attempts.last() != Some(&at) {
                attempts.push(at);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.shutdown().await;
    server.abort();

    assert!(attempts.len() >= 3, "only {} attempts", attempts.len());
    for pair in attempts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(250), "attempts {:?} apart", gap);
    }
    assert!(accepted.lock().unwrap().len() >= attempts.len() - 1);

    let status = client.status();
    assert_eq!(status.error, ErrorKind::HandshakeError);
    assert!(status.reconnect_attempts as usize >= attempts.len() - 1);
}

#[tokio::test]
async fn test_backoff_grows_up_to_the_cap() {
    let (uri, accepted, server) = dropping_listener().await;
    let settings = LighthouseSettings {
        uri,
        reconnect_interval_ms: 100,
        reconnect_max_delay_ms: 400,
        ..LighthouseSettings::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let client = LighthouseClient::new(settings, Arc::new(FixedLayoutCodec::default()), dispatcher);
    client.start();

    tokio::time::sleep(Duration::from_millis(1600)).await;
    client.shutdown().await;
    server.abort();

    // Delays 100, 200, 400, 400 ... => attempts at ~0, 100, 300, 700, 1100, 1500.
    let times = accepted.lock().unwrap().clone();
    assert!((4..=7).contains(&times.len()), "{} attempts", times.len());
    assert_eq!(client.status().current_delay, Duration::from_millis(400));
}
