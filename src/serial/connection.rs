use std::{fmt::Display, io, sync::Arc, time::Duration};

use bytes::Bytes;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::serial::error::{ConnectionError, StreamError};

/// Which port to open, and how fast it talks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Likely "/dev/ttyACMx" or "COMx".
    pub port: String,

    /// Must be positive.
    pub baud: u32,
}

impl ConnectionConfig {
    /// A validated config.
    pub fn new(port: &str, baud: u32) -> Result<Self, ConnectionError> {
        let config = Self {
            port: port.into(),
            baud,
        };
        config.validate()?;

        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), ConnectionError> {
        if self.baud == 0 {
            return Err(ConnectionError::InvalidBaud(self.baud));
        }

        Ok(())
    }
}

impl Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.port, self.baud)
    }
}

/// The state of a [`SerialConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing open.
    Closed,

    /// Trying to open a port.
    Opening,

    /// Bytes may arrive.
    Open,

    /// Opening or reading failed, with the reason.
    Failed(String),
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// An opened port we can read bytes from.
///
/// Reads must give up after a bounded time with [`io::ErrorKind::TimedOut`]
/// when nothing arrives, so the reader can notice it should stop.
pub trait SerialPortIo: io::Read + Send {}

impl<T: io::Read + Send> SerialPortIo for T {}

/// Knows how to open ports.
pub trait PortOpener: Send + Sync + 'static {
    /// Open the port described by `config`.
    /// Reads on the returned port should time out after `poll_interval`.
    fn open(
        &self,
        config: &ConnectionConfig,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialPortIo>, ConnectionError>;
}

/// Opens the serial ports of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(
        &self,
        config: &ConnectionConfig,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialPortIo>, ConnectionError> {
        let port = serialport::new(&config.port, config.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(poll_interval)
            .open()
            .map_err(|e| ConnectionError::from_serialport(&config.port, e))?;

        Ok(Box::new(port))
    }
}

/// The names of the serial ports on this machine.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| info.port_name)
            .sorted()
            .dedup()
            .collect(),
        Err(e) => {
            warn!(?e, "Could not list serial ports");
            vec![]
        }
    }
}

/// What a single [`SerialConnection::read`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Some bytes.
    Data(Bytes),

    /// Nothing arrived within the poll interval.
    Idle,

    /// The port is closed, or the device ended the stream.
    EndOfStream,
}

/// One connection at a time to a serial port.
pub struct SerialConnection {
    opener: Arc<dyn PortOpener>,
    poll_interval: Duration,

    port: Option<Box<dyn SerialPortIo>>,
    config: Option<ConnectionConfig>,
    state: ConnectionState,

    read_buffer: Vec<u8>,
}

impl SerialConnection {
    /// A closed connection which opens ports via `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, poll_interval: Duration) -> Self {
        Self {
            opener,
            poll_interval,
            port: None,
            config: None,
            state: ConnectionState::Closed,
            read_buffer: vec![0; 1024],
        }
    }

    /// Open a port. Any port already open is closed first.
    pub fn open(&mut self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        self.close();
        self.state = ConnectionState::Opening;
        self.config = Some(config.clone());

        let port = config
            .validate()
            .and_then(|()| self.opener.open(config, self.poll_interval));

        match port {
            Ok(port) => {
                info!(%config, "Serial port opened");
                self.port = Some(port);
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Read whatever is available, waiting at most the poll interval.
    ///
    /// A failed read closes the connection.
    pub fn read(&mut self) -> Result<ReadOutcome, StreamError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(ReadOutcome::EndOfStream);
        };

        match port.read(&mut self.read_buffer) {
            Ok(0) => {
                debug!("Device ended the stream");
                self.close();
                Ok(ReadOutcome::EndOfStream)
            }
            Ok(n) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(
                &self.read_buffer[..n],
            ))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => {
                let error = match e.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof => StreamError::Disconnected,
                    _ => StreamError::Io(e),
                };

                self.port = None;
                self.state = ConnectionState::Failed(error.to_string());
                Err(error)
            }
        }
    }

    /// Release the port. Closing a closed connection does nothing.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            if let Some(config) = &self.config {
                info!(%config, "Serial port closed");
            }
        }

        self.state = ConnectionState::Closed;
    }

    /// Is a port held right now?
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// See [`ConnectionState`].
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The config of the last [`SerialConnection::open`].
    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.close();
    }
}
