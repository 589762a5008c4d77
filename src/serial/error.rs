use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opening a serial port failed.
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionError {
    /// The baud rate must be positive.
    #[error("Invalid baud rate `{0}`")]
    InvalidBaud(u32),

    /// The port does not exist or is busy.
    #[error("Port `{port}` unavailable: {cause}")]
    PortUnavailable {
        /// The port we tried to open.
        port: String,

        /// What the OS said.
        cause: String,
    },

    /// Not allowed to open the port.
    #[error("Permission denied for port `{port}`: {cause}")]
    PermissionDenied {
        /// The port we tried to open.
        port: String,

        /// What the OS said.
        cause: String,
    },

    /// Anything else.
    #[error("Could not open port `{port}`: {cause}")]
    Other {
        /// The port we tried to open.
        port: String,

        /// What the OS said.
        cause: String,
    },
}

impl ConnectionError {
    /// Classify a [`serialport::Error`] from opening `port`.
    pub fn from_serialport(port: &str, error: serialport::Error) -> Self {
        let port = port.to_owned();
        let cause = error.description.clone();

        match error.kind() {
            serialport::ErrorKind::NoDevice => Self::PortUnavailable { port, cause },
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                Self::PortUnavailable { port, cause }
            }
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Self::PermissionDenied { port, cause }
            }
            _ if cause.to_lowercase().contains("busy") => Self::PortUnavailable { port, cause },
            _ if cause.to_lowercase().contains("denied") => Self::PermissionDenied { port, cause },
            _ => Self::Other { port, cause },
        }
    }
}

/// Reading from an open serial port failed.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The device went away.
    #[error("Serial port disconnected")]
    Disconnected,

    /// IO related errors.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_device_is_unavailable() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");

        assert!(matches!(
            ConnectionError::from_serialport("COM3", err),
            ConnectionError::PortUnavailable { .. }
        ));
    }

    #[test]
    fn permission_denied() {
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "Permission denied",
        );

        let err = ConnectionError::from_serialport("/dev/ttyUSB0", err);
        assert!(matches!(err, ConnectionError::PermissionDenied { .. }));
        assert!(err.to_string().contains("/dev/ttyUSB0"));
    }

    #[test]
    fn busy_port_is_unavailable() {
        let err = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");

        assert!(matches!(
            ConnectionError::from_serialport("COM3", err),
            ConnectionError::PortUnavailable { .. }
        ));
    }
}
