use std::net::SocketAddr;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    bridge::{BridgeHandle, Status},
    error::Error,
    serial::connection::available_ports,
    websocket,
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 8000;

const DEFAULT_COM_PORT: &str = "COM3";
const DEFAULT_BAUD_RATE: u32 = 9600;

/// The body of a settings update.
///
/// Both fields are optional. The baud rate may be a number or a string holding one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsRequest {
    /// The serial port to switch to.
    pub com_port: Option<String>,

    /// The baud rate to switch to.
    pub baud_rate: Option<serde_json::Value>,
}

impl SettingsRequest {
    fn port(&self) -> String {
        self.com_port
            .clone()
            .unwrap_or_else(|| DEFAULT_COM_PORT.to_owned())
    }

    /// Text which is not a number at all means the default.
    /// Numbers which do not fit a baud rate become zero, which is rejected later on.
    fn baud(&self) -> u32 {
        let parsed = match &self.baud_rate {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        match parsed {
            Some(n) => u32::try_from(n).unwrap_or(0),
            None => DEFAULT_BAUD_RATE,
        }
    }
}

/// Was a settings update applied?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsStatus {
    /// The new port is streaming.
    Ok,

    /// See the error field.
    Error,
}

/// The reply to a settings update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsResponse {
    /// Did it work.
    pub status: SettingsStatus,

    /// The port in effect (or which failed).
    pub com_port: String,

    /// The baud rate in effect (or which failed).
    pub baud_rate: u32,

    /// What went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Apply a settings request to the bridge.
pub async fn apply_settings(bridge: &BridgeHandle, request: &SettingsRequest) -> SettingsResponse {
    let port = request.port();
    let baud = request.baud();

    match bridge.apply_settings(&port, baud).await {
        Ok(config) => {
            info!(%config, "Settings applied");
            SettingsResponse {
                status: SettingsStatus::Ok,
                com_port: config.port,
                baud_rate: config.baud,
                error: None,
            }
        }
        Err(e) => {
            warn!(%e, %port, %baud, "Settings not applied");
            SettingsResponse {
                status: SettingsStatus::Error,
                com_port: port,
                baud_rate: baud,
                error: Some(e.to_string()),
            }
        }
    }
}

/// The routes of the server.
pub fn router(bridge: BridgeHandle) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/update_settings", post(update_settings))
        .route("/status", get(show_status))
        .route("/ports", get(show_ports))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each handler needs to be able to reach the bridge
                .layer(Extension(bridge)),
        )
}

async fn run(
    bridge: BridgeHandle,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    let app = router(bridge);

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Io(format!("Could not bind {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        // Nobody listening for the port is fine, we serve anyway.
        let _ = port_reply.send(addr.port());
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Io(format!("Server error: {e}")))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    bridge: BridgeHandle,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    run(bridge, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(bridge: BridgeHandle, port: u16) -> Result<(), Error> {
    run(bridge, Some(port), None).await
}

async fn update_settings(
    Extension(bridge): Extension<BridgeHandle>,
    Json(request): Json<SettingsRequest>,
) -> Json<SettingsResponse> {
    Json(apply_settings(&bridge, &request).await)
}

async fn show_status(Extension(bridge): Extension<BridgeHandle>) -> Json<Status> {
    Json(bridge.status())
}

async fn show_ports() -> impl IntoResponse {
    Json(available_ports())
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Bridge v{}\n", env!("CARGO_PKG_VERSION"))
}
