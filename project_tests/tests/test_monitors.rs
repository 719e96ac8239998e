use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_panopticon::core::{Channel, ChannelValue, Dispatcher, ErrorKind, ManagedService};
use lib_panopticon::ingestors::{
    HealthBand, HealthMonitor, HealthSource, KeyedStreamEntry, PollMonitor, PollOptions, StoreMonitor,
    StreamTailSource,
};
use lib_panopticon::core::RetryPolicy;
use project_tests::{MemoryConnector, wait_until};
use tokio_util::sync::CancellationToken;

fn options() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(40),
        retry: RetryPolicy::fixed(Duration::from_millis(40)),
        max_connect_attempts: None,
    }
}

#[tokio::test]
async fn test_health_pool_pairs_cap_and_health() {
    let store = MemoryConnector::new();
    store.set("svc/a:__healthpool__temp_cap", "100");
    store.set("svc/a:__healthpool__temp_health", "40");
    store.set("svc/b:__healthpool__disk_health", "10");
    store.set("svc/c:__healthpool__mem_cap", "");
    store.set("svc/c:__healthpool__mem_health", "5");
    store.set("unrelated:key", "1");

    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: HealthMonitor<MemoryConnector> =
        PollMonitor::new(HealthSource, store.clone(), options(), Arc::clone(&dispatcher));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    monitor.subscribe(move |value| {
        if let ChannelValue::HealthMetrics(metrics) = value {
            sink.lock().unwrap().push(Arc::clone(metrics));
        }
        Ok(())
    });
    assert!(monitor.is_polling());

    assert!(wait_until(Duration::from_secs(2), || monitor.latest().is_some()).await);
    dispatcher.flush();

    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    let metrics = &delivered[0];
    assert_eq!(metrics.len(), 2, "only complete pairs are reported: {:?}", metrics.keys());

    let temp = &metrics["svc/a[temp]"];
    assert_eq!(temp.health, 40);
    assert_eq!(temp.cap, 100);
    assert_eq!(temp.percentage(), 40.0);
    assert_eq!(temp.status(), HealthBand::Warning);

    let mem = &metrics["svc/c[mem]"];
    assert_eq!(mem.cap, 0);
    assert_eq!(mem.status(), HealthBand::Critical);

    // Health republishes every tick, even unchanged.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dispatcher.pending(Channel::HealthMetrics).is_some());

    monitor.shutdown().await;
    assert!(!monitor.is_polling());
}

#[tokio::test]
async fn test_stream_tail_follows_greatest_key_and_publishes_changes_only() {
    let store = MemoryConnector::new();
    store.append("logs:app:1:state_server:x:info", "1-0", &[("state", "old")]);
    store.append("logs:app:2:state_server:x:info", "5-0", &[("state", "idle")]);
    store.append("logs:app:2:state_server:x:info", "6-0", &[("state", "running")]);
    store.append("logs:app:3:other:x:info", "9-0", &[("state", "ignored")]);

    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: StoreMonitor<MemoryConnector> =
        PollMonitor::new(StreamTailSource::default(), store.clone(), options(), Arc::clone(&dispatcher));

    let seen: Arc<Mutex<Vec<KeyedStreamEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    monitor.subscribe(move |value| {
        if let ChannelValue::StreamEntry(entry) = value {
            sink.lock().unwrap().push((**entry).clone());
        }
        Ok(())
    });

    assert!(wait_until(Duration::from_secs(2), || monitor.latest().is_some()).await);
    dispatcher.flush();
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key, "logs:app:2:state_server:x:info");
        assert_eq!(seen[0].id, "6-0");
        assert_eq!(seen[0].data["state"], "running");
    }

    // Several ticks with no new entry: nothing new to deliver.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(dispatcher.flush().channels, 0);

    store.append("logs:app:2:state_server:x:info", "7-0", &[("state", "stopped")]);
    assert!(wait_until(Duration::from_secs(2), || {
        monitor.latest().is_some_and(|e| e.id == "7-0")
    })
    .await);
    dispatcher.flush();
    assert_eq!(seen.lock().unwrap().len(), 2);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_is_reported_and_recovered() {
    let store = MemoryConnector::new();
    store.set("svc:__healthpool__cpu_cap", "10");
    store.set("svc:__healthpool__cpu_health", "10");
    store.set_available(false);

    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: HealthMonitor<MemoryConnector> =
        PollMonitor::new(HealthSource, store.clone(), options(), Arc::clone(&dispatcher));
    monitor.subscribe(|_| Ok(()));

    assert!(wait_until(Duration::from_secs(2), || monitor.status().reconnect_attempts >= 2).await);
    assert_eq!(monitor.status().error, ErrorKind::StoreUnavailable);
    assert!(!monitor.status().connected);

    store.set_available(true);
    assert!(wait_until(Duration::from_secs(2), || monitor.status().connected).await);
    assert_eq!(monitor.status().reconnect_attempts, 0);

    // An outage on an open connection drops it and reconnects later.
    let connects = store.connects();
    store.set_available(false);
    assert!(wait_until(Duration::from_secs(2), || !monitor.status().connected).await);
    store.set_available(true);
    assert!(wait_until(Duration::from_secs(2), || store.connects() > connects).await);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_connect_with_retry_gives_up_after_max_attempts() {
    let store = MemoryConnector::new();
    store.set_available(false);
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: HealthMonitor<MemoryConnector> = PollMonitor::new(
        HealthSource,
        store,
        PollOptions {
            max_connect_attempts: Some(3),
            ..options()
        },
        dispatcher,
    );

    let err = monitor.connect_with_retry(&CancellationToken::new()).await.err();
    assert!(
        matches!(err, Some(lib_panopticon::StoreError::RetriesExhausted { attempts: 3, .. })),
        "{:?}",
        err
    );
    assert_eq!(monitor.status().reconnect_attempts, 3);
}

#[tokio::test]
async fn test_last_unsubscribe_stops_polling() {
    let store = MemoryConnector::new();
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: HealthMonitor<MemoryConnector> =
        PollMonitor::new(HealthSource, store, options(), Arc::clone(&dispatcher));

    let a = monitor.subscribe(|_| Ok(()));
    let b = monitor.subscribe(|_| Ok(()));
    assert_eq!(dispatcher.subscriber_count(Channel::HealthMetrics), 2);

    assert!(monitor.unsubscribe(a).await);
    assert!(monitor.is_polling());
    assert!(!monitor.unsubscribe(a).await);

    assert!(monitor.unsubscribe(b).await);
    assert!(!monitor.is_polling());
    assert_eq!(dispatcher.subscriber_count(Channel::HealthMetrics), 0);
    assert!(!monitor.status().connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubscribe_racing_last_unsubscribe_keeps_polling() {
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(1)));
    let monitor: Arc<HealthMonitor<MemoryConnector>> = Arc::new(PollMonitor::new(
        HealthSource,
        MemoryConnector::new(),
        options(),
        Arc::clone(&dispatcher),
    ));

    for _ in 0..100 {
        let leaving = monitor.subscribe(|_| Ok(()));

        let m = Arc::clone(&monitor);
        let unsubscribe = tokio::spawn(async move { m.unsubscribe(leaving).await });
        let m = Arc::clone(&monitor);
        let subscribe = tokio::spawn(async move { m.subscribe(|_| Ok(())) });

        assert!(unsubscribe.await.unwrap());
        let staying = subscribe.await.unwrap();
        assert_eq!(monitor.subscriber_count(), 1);
        assert!(monitor.is_polling(), "a subscriber was left without a poll loop");

        assert!(monitor.unsubscribe(staying).await);
        assert!(!monitor.is_polling());
    }
}
