use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use serial_bridge::{
    bridge::BridgeHandle, cli, config::Config, logging, mock::MockOpener, monitor::Monitor,
    serial::connection::SystemPorts, server,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, warn, Level};

const MOCK_PORT: &str = "mock-sensor";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command);

        return Ok(());
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };
    cli.apply_overrides(&mut config);

    if cli.mock {
        config.port = MOCK_PORT.into();
    }

    config.validate()?;

    logging::init(
        Level::INFO,
        config.log_dir.clone().map(|dir| (Level::DEBUG, dir)),
    )
    .await;
    debug!(?config, "Using config");

    let bridge = if cli.mock {
        let opener = MockOpener::new();
        opener
            .add_port(MOCK_PORT)
            .spawn_sensor_demo(Duration::from_secs(1));

        BridgeHandle::new(opener, config.bridge_settings())?
    } else {
        BridgeHandle::new(SystemPorts, config.bridge_settings())?
    };

    if config.auto_connect {
        // A port which is not there is not fatal, the settings endpoint can fix it.
        if let Err(e) = bridge.start(config.connection()?).await {
            warn!(%e, "Serial port not opened");
        }
    }

    if cli.monitor {
        let (monitor, _panel) = Monitor::new(&bridge);
        tokio::spawn(monitor.run());
    }

    let result = run(bridge.clone(), config.listen_port).await;

    let shutdown = bridge.shutdown().await;
    logging::shutdown();

    shutdown?;
    result
}

#[cfg(unix)]
async fn run(bridge: BridgeHandle, listen_port: u16) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup.recv() => {
            info!("Told to hang up, quitting")
        }
        result = server::run_on_port(bridge, listen_port) => {
            error!("Server returned");
            result?;
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn run(bridge: BridgeHandle, listen_port: u16) -> Result<()> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        result = server::run_on_port(bridge, listen_port) => {
            error!("Server returned");
            result?;
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    Ok(())
}
