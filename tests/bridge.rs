use std::time::{Duration, Instant};

use color_eyre::Result;
use common::{config, mock_bridge, mock_bridge_with_settings, recv, recv_n, settings, wait_for, Recorder};
use pretty_assertions::assert_eq;
use serial_bridge::{
    bridge::{BridgeHandle, BridgePhase, BridgeSettings},
    mock::MockOpener,
    serial::connection::ConnectionState,
};

mod common;

#[tokio::test]
async fn lines_reach_every_subscriber_in_order() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge(&["COM3"]);
    let mut first = bridge.subscribe();
    let mut second = bridge.subscribe();

    bridge.start(config("COM3")).await?;

    devices[0].send("one\ntw");
    devices[0].send("o\n\nthree\r\n");

    let expected = vec!["one", "two", "", "three"];
    assert_eq!(recv_n(&mut first, 4).await?, expected);
    assert_eq!(recv_n(&mut second, 4).await?, expected);

    Ok(())
}

#[tokio::test]
async fn bad_utf8_is_delivered_marked() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge(&["COM3"]);
    let mut subscription = bridge.subscribe();

    bridge.start(config("COM3")).await?;
    devices[0].send(b"\xff\xfe\nfine\n");

    let bad = recv(&mut subscription).await?;
    assert!(bad.decode_failed());

    let fine = recv(&mut subscription).await?;
    assert!(!fine.decode_failed());
    assert_eq!(fine.as_str(), "fine");

    Ok(())
}

#[tokio::test]
async fn reconfigure_while_streaming_keeps_exactly_one_connection() -> Result<()> {
    let (opener, devices, bridge) = mock_bridge(&["COM3", "COM4"]);
    let mut subscription = bridge.subscribe();

    bridge.start(config("COM3")).await?;
    devices[0].send("from three\n");
    assert_eq!(recv(&mut subscription).await?.as_str(), "from three");

    let effective = bridge.reconfigure(config("COM4")).await?;
    assert_eq!(effective, config("COM4"));

    let stats = opener.stats();
    assert_eq!(stats.opens(), 2);
    assert_eq!(stats.closes(), 1);
    assert_eq!(stats.open_now(), 1);
    assert_eq!(stats.max_open(), 1);

    // The subscription survives the swap.
    devices[1].send("from four\n");
    assert_eq!(recv(&mut subscription).await?.as_str(), "from four");

    let status = bridge.status();
    assert_eq!(status.phase, BridgePhase::Streaming);
    assert_eq!(status.config, Some(config("COM4")));
    assert_eq!(status.generation, 2);

    Ok(())
}

#[tokio::test]
async fn concurrent_reconfigures_apply_in_call_order() -> Result<()> {
    let (opener, _devices, bridge) = mock_bridge(&["COM3", "COM4", "COM5"]);
    bridge.start(config("COM3")).await?;

    let (a, b, c) = tokio::join!(
        bridge.reconfigure(config("COM4")),
        bridge.reconfigure(config("COM5")),
        bridge.reconfigure(config("COM3")),
    );

    assert_eq!(a?, config("COM4"));
    assert_eq!(b?, config("COM5"));
    assert_eq!(c?, config("COM3"));

    let stats = opener.stats();
    assert_eq!(stats.opens(), 4);
    assert_eq!(stats.open_now(), 1);
    assert_eq!(stats.max_open(), 1);
    assert_eq!(bridge.status().config, Some(config("COM3")));

    Ok(())
}

#[tokio::test]
async fn reconfigure_discards_partial_line() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge(&["COM3", "COM4"]);
    let mut subscription = bridge.subscribe();

    bridge.start(config("COM3")).await?;
    devices[0].send("stale with no newline");

    bridge.reconfigure(config("COM4")).await?;
    devices[1].send("fresh\n");

    assert_eq!(recv(&mut subscription).await?.as_str(), "fresh");

    Ok(())
}

#[tokio::test]
async fn failed_reconfigure_leaves_no_connection() -> Result<()> {
    let (opener, _devices, bridge) = mock_bridge(&["COM3"]);
    opener.deny("COM4");

    bridge.start(config("COM3")).await?;
    let result = bridge.reconfigure(config("COM4")).await;

    assert!(result.is_err());
    assert_eq!(opener.stats().open_now(), 0);

    let status = bridge.status();
    assert_eq!(status.phase, BridgePhase::Failed);
    assert!(status.last_error.unwrap().contains("Permission denied"));

    Ok(())
}

#[tokio::test]
async fn stop_with_silent_device_is_prompt() -> Result<()> {
    let (opener, _devices, bridge) = mock_bridge_with_settings(
        &["COM3"],
        BridgeSettings {
            poll_interval: Duration::from_millis(200),
            ..Default::default()
        },
    );

    bridge.start(config("COM3")).await?;

    // Let the worker get stuck in a read.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    bridge.stop().await?;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(opener.stats().open_now(), 0);

    let status = bridge.status();
    assert_eq!(status.phase, BridgePhase::Stopped);
    assert_eq!(status.state, ConnectionState::Closed);

    // Stopping again is fine.
    bridge.stop().await?;

    Ok(())
}

#[tokio::test]
async fn unplugged_device_fails_without_retrying() -> Result<()> {
    let (opener, devices, bridge) = mock_bridge(&["COM3"]);
    let mut subscription = bridge.subscribe();
    let mut status = bridge.watch_status();

    bridge.start(config("COM3")).await?;
    devices[0].send("before\n");
    assert_eq!(recv(&mut subscription).await?.as_str(), "before");

    devices[0].unplug();

    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow_and_update().phase != BridgePhase::Failed {
            status.changed().await.expect("Worker is alive");
        }
    })
    .await?;

    assert!(matches!(bridge.status().state, ConnectionState::Failed(_)));

    // Nobody tries again on their own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(opener.stats().opens(), 1);
    assert_eq!(opener.stats().open_now(), 0);

    // An explicit start recovers, and subscribers are still there.
    bridge.start(config("COM3")).await?;
    devices[0].send("after\n");
    assert_eq!(recv(&mut subscription).await?.as_str(), "after");

    Ok(())
}

#[tokio::test]
async fn end_of_stream_flushes_tail() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge(&["COM3"]);
    let mut subscription = bridge.subscribe();

    bridge.start(config("COM3")).await?;
    devices[0].send("complete\nunterminated");
    devices[0].end();

    assert_eq!(
        recv_n(&mut subscription, 2).await?,
        vec!["complete", "unterminated"]
    );

    wait_for(|| bridge.status().phase == BridgePhase::Stopped).await?;
    assert_eq!(bridge.status().state, ConnectionState::Closed);

    Ok(())
}

#[tokio::test]
async fn slow_subscriber_does_not_hold_back_others() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge_with_settings(
        &["COM3"],
        BridgeSettings {
            queue_capacity: 8,
            max_saturation: 4,
            ..settings()
        },
    );

    let mut slow = bridge.subscribe();
    let fast = Recorder::new();
    bridge.add_subscriber(fast.clone());

    bridge.start(config("COM3")).await?;

    let lines: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
    for line in &lines {
        devices[0].send(format!("{line}\n"));
    }

    wait_for(|| fast.lines().len() == lines.len()).await?;
    assert_eq!(fast.lines(), lines);

    // The slow one kept what fit, then got dropped.
    assert_eq!(bridge.subscriber_count(), 1);
    assert_eq!(recv_n(&mut slow, 8).await?, lines[..8].to_vec());
    assert_eq!(slow.recv().await, None);

    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_delivery() -> Result<()> {
    let (_opener, devices, bridge) = mock_bridge(&["COM3"]);
    let mut leaving = bridge.subscribe();
    let mut staying = bridge.subscribe();

    bridge.start(config("COM3")).await?;
    assert!(bridge.unsubscribe(leaving.id()));

    devices[0].send("hello\n");

    assert_eq!(recv(&mut staying).await?.as_str(), "hello");
    assert_eq!(leaving.recv().await, None);

    Ok(())
}

#[tokio::test]
async fn dropping_every_handle_releases_the_port() -> Result<()> {
    let opener = MockOpener::new();
    let _device = opener.add_port("COM3");
    let bridge = BridgeHandle::new(opener.clone(), settings())?;

    bridge.start(config("COM3")).await?;
    assert_eq!(opener.stats().open_now(), 1);

    drop(bridge);

    wait_for(|| opener.stats().open_now() == 0).await?;

    Ok(())
}
