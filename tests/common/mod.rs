#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::StreamExt;
use serial_bridge::{
    bridge::{BridgeHandle, BridgeSettings},
    mock::{MockDevice, MockOpener},
    registry::{Delivery, Subscriber, Subscription},
    serial::{connection::ConnectionConfig, Line},
};
use tokio::{net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn settings() -> BridgeSettings {
    BridgeSettings {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn config(port: &str) -> ConnectionConfig {
    ConnectionConfig::new(port, 9600).expect("Test configs are valid")
}

/// A bridge over mocked ports with the given names, and the device end of each port.
pub fn mock_bridge(ports: &[&str]) -> (MockOpener, Vec<MockDevice>, BridgeHandle) {
    mock_bridge_with_settings(ports, settings())
}

pub fn mock_bridge_with_settings(
    ports: &[&str],
    settings: BridgeSettings,
) -> (MockOpener, Vec<MockDevice>, BridgeHandle) {
    let opener = MockOpener::new();
    let devices = ports.iter().map(|port| opener.add_port(port)).collect();
    let bridge = BridgeHandle::new(opener.clone(), settings).expect("Worker should spawn");

    (opener, devices, bridge)
}

pub async fn recv(subscription: &mut Subscription) -> Result<Line> {
    timeout(Duration::from_secs(5), subscription.recv())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Subscription ended"))
}

pub async fn recv_n(subscription: &mut Subscription, n: usize) -> Result<Vec<String>> {
    let mut lines = vec![];

    for _ in 0..n {
        lines.push(recv(subscription).await?.as_str().to_owned());
    }

    Ok(lines)
}

/// Poll until the condition holds, or fail after a while.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
}

/// Takes every line, never falls behind.
#[derive(Default)]
pub struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Subscriber for Recorder {
    fn receive(&self, line: &Line) -> Delivery {
        self.lines.lock().unwrap().push(line.as_str().to_owned());
        Delivery::Delivered
    }

    fn end_of_stream(&self) {}
}

pub async fn start_server(bridge: BridgeHandle) -> u16 {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move { serial_bridge::server::run_any_port(bridge, port_tx).await });
    port_rx
        .await
        .expect("Server should reply with allocated port")
}

pub async fn connect(port: u16) -> Result<Client> {
    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn receive_text(client: &mut Client) -> Result<String> {
    let message = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    Ok(message.into_text()?)
}
