use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::{connection::ConnectionConfig, error::ConnectionError};

/// Errors from asking the bridge to do something.
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BridgeError {
    /// The port could not be opened.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Started while already streaming from this config.
    /// Use reconfigure to switch ports.
    #[error("Already running on {0}")]
    AlreadyRunning(ConnectionConfig),

    /// The worker thread is not there to do it.
    #[error("The bridge worker has stopped")]
    WorkerGone,

    /// The worker thread could not be started.
    #[error("Could not start the bridge worker: {0}")]
    Spawn(String),
}

/// Errors that may occur in this library, outside the bridge itself.
#[derive(Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The configuration is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Some file or socket could not be used.
    #[error("IO problem: {0}")]
    Io(String),

    /// See [`BridgeError`].
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl Error {
    /// Returns `Ok(problem)` if the error is [`Error::BadConfig`].
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
