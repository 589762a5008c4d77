#![deny(missing_docs)]

//! This crate bridges a serial device printing lines of text to any number of consumers.
//!
//! The serial port is read on a dedicated thread, because reading it blocks.
//! Every complete line is broadcast to all subscribers, each of which has a bounded queue.
//! A slow subscriber loses lines instead of slowing down the reader or the other subscribers.
//!
//! The port can be swapped at runtime: reconfiguration closes the old port before opening the new one,
//! and requests are applied one at a time, in order.
//!
//! Consumers shipped here:
//! - a websocket server, sending each line as a text frame,
//! - a monitor decoding humidity/temperature sensor lines.

/// The bridge itself: the read loop thread, and the handle used to control it.
pub mod bridge;

/// Subscribers, and the registry broadcasting lines to them.
pub mod registry;

/// Serial lines, the framer producing them, and the connection to the device.
pub mod serial;

/// Decoding of sensor readings from lines.
pub mod sensor;

/// A consumer keeping the latest sensor reading.
pub mod monitor;

/// Mocked serial ports.
pub mod mock;

/// Code relating to setting up the server which exposes the bridge over HTTP and websockets.
pub mod server;

/// Handles incoming websockets.
pub(crate) mod websocket;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
