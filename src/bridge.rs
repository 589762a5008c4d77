//! The bridge runs the blocking serial read loop on its own thread
//! and fans the lines out to subscribers.
//!
//! The worker thread owns the [`SerialConnection`] and the [`LineFramer`].
//! Async code only ever holds a [`BridgeHandle`], which sends commands to the worker
//! and gets replies on oneshot channels.
//! Commands are handled one at a time in the order they were sent,
//! so concurrent reconfigurations queue up behind each other.

use std::{fmt::Display, sync::Arc, thread, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{self, error::TryRecvError},
    oneshot, watch,
};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    error::BridgeError,
    registry::{Subscriber, SubscriberId, SubscriberRegistry, Subscription},
    serial::{
        connection::{ConnectionConfig, ConnectionState, PortOpener, ReadOutcome, SerialConnection},
        framer::LineFramer,
        Line,
    },
};

/// Tunables of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Upper bound on how long a single read blocks.
    /// Also bounds how long stopping takes.
    pub poll_interval: Duration,

    /// Lines queued per subscriber before dropping.
    pub queue_capacity: usize,

    /// Dropped lines in a row before a subscriber is removed.
    pub max_saturation: usize,

    /// Splits lines.
    pub delimiter: u8,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            queue_capacity: 256,
            max_saturation: 64,
            delimiter: b'\n',
        }
    }
}

/// Where the bridge is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgePhase {
    /// Never started.
    Idle,

    /// Opening the first port.
    Connecting,

    /// Reading lines.
    Streaming,

    /// Swapping an open port for another.
    Reconnecting,

    /// Stopped on request, or the device ended the stream.
    Stopped,

    /// Opening or reading failed. Needs a new start or reconfigure.
    Failed,
}

impl BridgePhase {
    fn connection_state(self, last_error: Option<&String>) -> ConnectionState {
        match self {
            BridgePhase::Idle | BridgePhase::Stopped => ConnectionState::Closed,
            BridgePhase::Connecting | BridgePhase::Reconnecting => ConnectionState::Opening,
            BridgePhase::Streaming => ConnectionState::Open,
            BridgePhase::Failed => {
                ConnectionState::Failed(last_error.cloned().unwrap_or_default())
            }
        }
    }

    fn is_running(self) -> bool {
        matches!(
            self,
            BridgePhase::Connecting | BridgePhase::Streaming | BridgePhase::Reconnecting
        )
    }
}

/// A snapshot of the bridge, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// See [`BridgePhase`].
    pub phase: BridgePhase,

    /// The connection's view of the same thing.
    pub state: ConnectionState,

    /// The config in use, or last tried.
    pub config: Option<ConnectionConfig>,

    /// Why the last open or read failed, if it did.
    pub last_error: Option<String>,

    /// Bumped on every successful open.
    /// A change means consumers now see a different connection.
    pub generation: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            phase: BridgePhase::Idle,
            state: ConnectionState::Closed,
            config: None,
            last_error: None,
            generation: 0,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.config {
            Some(config) => write!(f, "{} ({config})", self.state),
            None => write!(f, "{}", self.state),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum Command {
    Start(ConnectionConfig, Reply<Result<ConnectionConfig, BridgeError>>),
    Reconfigure(ConnectionConfig, Reply<Result<ConnectionConfig, BridgeError>>),
    Stop(Reply<()>),
    Shutdown(Reply<()>),
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Start(config, _) => write!(f, "start {config}"),
            Command::Reconfigure(config, _) => write!(f, "reconfigure to {config}"),
            Command::Stop(_) => write!(f, "stop"),
            Command::Shutdown(_) => write!(f, "shutdown"),
        }
    }
}

/// Used to talk to a running bridge.
///
/// Cheap to clone. When the last handle is dropped the worker closes the port and exits.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<SubscriberRegistry>,
    status: watch::Receiver<Status>,
}

impl BridgeHandle {
    /// Spawn the worker thread of a new, idle bridge.
    pub fn new<O: PortOpener>(opener: O, settings: BridgeSettings) -> Result<Self, BridgeError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());
        let registry = Arc::new(SubscriberRegistry::new(
            settings.queue_capacity,
            settings.max_saturation,
        ));

        let worker = Worker {
            connection: SerialConnection::new(Arc::new(opener), settings.poll_interval),
            framer: LineFramer::new(settings.delimiter),
            registry: registry.clone(),
            status: status_tx,
            commands: commands_rx,
        };

        thread::Builder::new()
            .name("serial-bridge".into())
            .spawn(move || worker.run())
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        Ok(Self {
            commands: commands_tx,
            registry,
            status: status_rx,
        })
    }

    /// Open the port and start streaming.
    ///
    /// On failure the bridge is left [`BridgePhase::Failed`], no retries are made.
    pub async fn start(&self, config: ConnectionConfig) -> Result<ConnectionConfig, BridgeError> {
        self.request(|reply| Command::Start(config, reply)).await?
    }

    /// Close whatever is open and stream from the given port instead.
    ///
    /// May be called in any phase.
    /// Calls are applied one after the other, in the order they were made.
    pub async fn reconfigure(
        &self,
        config: ConnectionConfig,
    ) -> Result<ConnectionConfig, BridgeError> {
        self.request(|reply| Command::Reconfigure(config, reply))
            .await?
    }

    /// Reconfigure to user provided settings.
    /// Returns the config now in effect.
    ///
    /// Settings which do not validate fail the same way a port which does not open does,
    /// so the failure shows up in [`Status::last_error`].
    pub async fn apply_settings(
        &self,
        port: &str,
        baud: u32,
    ) -> Result<ConnectionConfig, BridgeError> {
        let config = ConnectionConfig {
            port: port.to_owned(),
            baud,
        };

        self.reconfigure(config).await
    }

    /// Stop streaming and release the port.
    ///
    /// Returns once the port is closed.
    /// Subscribers stay registered, and get lines again after a new start.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.request(Command::Stop).await
    }

    /// Stop, end every subscription, and let the worker thread exit.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(Command::Shutdown).await
    }

    /// The current status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Get notified of status changes.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Start receiving lines.
    pub fn subscribe(&self) -> Subscription {
        self.registry.subscribe()
    }

    /// Register a custom subscriber.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        self.registry.add(subscriber)
    }

    /// Stop receiving lines.
    /// Returns false if the subscriber was already removed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.remove(id)
    }

    /// How many subscribers are registered.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, BridgeError> {
        let (tx, rx) = oneshot::channel();

        self.commands
            .send(command(tx))
            .map_err(|_| BridgeError::WorkerGone)?;

        rx.await.map_err(|_| BridgeError::WorkerGone)
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Worker {
    connection: SerialConnection,
    framer: LineFramer,
    registry: Arc<SubscriberRegistry>,
    status: watch::Sender<Status>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    fn run(mut self) {
        let _span = info_span!("bridge").entered();
        debug!("Worker started");

        loop {
            let command = if self.phase() == BridgePhase::Streaming {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                // Nothing to read, so just wait for something to do.
                match self.commands.blocking_recv() {
                    Some(command) => Some(command),
                    None => break,
                }
            };

            match command {
                Some(command) => {
                    if let Flow::Exit = self.handle(command) {
                        debug!("Worker shut down");
                        return;
                    }
                }
                None => self.read_once(),
            }
        }

        debug!("All handles dropped");
        self.connection.close();
        self.registry.close_all();
    }

    fn handle(&mut self, command: Command) -> Flow {
        debug!(%command, "Handling command");

        match command {
            Command::Start(config, reply) => {
                let result = if self.phase().is_running() {
                    Err(BridgeError::AlreadyRunning(
                        self.connection.config().cloned().unwrap_or(config),
                    ))
                } else {
                    self.connect(config)
                };

                let _ = reply.send(result);
            }
            Command::Reconfigure(config, reply) => {
                let result = self.connect(config);
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.stop();
                self.registry.close_all();
                let _ = reply.send(());

                return Flow::Exit;
            }
        }

        Flow::Continue
    }

    fn connect(&mut self, config: ConnectionConfig) -> Result<ConnectionConfig, BridgeError> {
        let phase = if self.connection.is_open() {
            BridgePhase::Reconnecting
        } else {
            BridgePhase::Connecting
        };

        let span = info_span!("connect", %config);
        let _entered = span.enter();

        self.update(|status| {
            status.phase = phase;
            status.config = Some(config.clone());
        });

        // Bytes from the old port must not end up in lines of the new one.
        self.connection.close();
        self.framer.reset();

        match self.connection.open(&config) {
            Ok(()) => {
                info!("Streaming");
                self.update(|status| {
                    status.phase = BridgePhase::Streaming;
                    status.last_error = None;
                    status.generation += 1;
                });

                Ok(config)
            }
            Err(e) => {
                error!(%e, "Could not open serial port");
                self.update(|status| {
                    status.phase = BridgePhase::Failed;
                    status.last_error = Some(e.to_string());
                });

                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        self.connection.close();
        self.framer.reset();

        if self.phase() != BridgePhase::Idle {
            self.update(|status| status.phase = BridgePhase::Stopped);
        }
    }

    fn read_once(&mut self) {
        match self.connection.read() {
            Ok(ReadOutcome::Data(bytes)) => {
                trace!("Read {} byte(s)", bytes.len());
                let generation = self.generation();

                for line in self.framer.feed(&bytes) {
                    Self::publish(&self.registry, line.with_generation(generation));
                }
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::EndOfStream) => {
                info!("Device ended the stream");

                let generation = self.generation();
                while let Some(line) = self.framer.finish() {
                    Self::publish(&self.registry, line.with_generation(generation));
                }

                self.connection.close();
                self.update(|status| status.phase = BridgePhase::Stopped);
            }
            Err(e) => {
                error!(%e, "Serial port error, stopping");
                self.framer.reset();
                self.update(|status| {
                    status.phase = BridgePhase::Failed;
                    status.last_error = Some(e.to_string());
                });
            }
        }
    }

    fn publish(registry: &SubscriberRegistry, line: Line) {
        if line.decode_failed() {
            warn!(%line, "Line is not valid UTF-8");
        }

        registry.broadcast(&line);
    }

    fn phase(&self) -> BridgePhase {
        self.status.borrow().phase
    }

    fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    fn update(&self, modify: impl FnOnce(&mut Status)) {
        self.status.send_modify(|status| {
            modify(status);
            status.state = status.phase.connection_state(status.last_error.as_ref());
        });

        debug!(status = %*self.status.borrow(), "Status");
    }
}
