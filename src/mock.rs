//! A mock, useful to test the bridge without the actual serial ports.
//!
//! Ports are registered by name on a [`MockOpener`].
//! Each registered port gets a [`MockDevice`], which is the "other end of the wire":
//! bytes sent on it are what reads on the opened port return.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use tracing::{debug, info, trace};

use crate::serial::{
    connection::{ConnectionConfig, PortOpener, SerialPortIo},
    error::ConnectionError,
};

#[derive(Debug)]
enum MockInput {
    Bytes(Vec<u8>),
    Unplug,
    EndOfStream,
}

/// How a mocked port reacts to being opened.
#[derive(Debug)]
enum MockPortKind {
    Device(Arc<Mutex<mpsc::Receiver<MockInput>>>),
    Denied,
}

/// Counts what happened to mocked ports.
#[derive(Debug, Default)]
pub struct MockStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    open_now: AtomicUsize,
    max_open: AtomicUsize,
}

impl MockStats {
    /// How many times a port was opened successfully.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// How many opened ports were closed (dropped).
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// How many ports are open right now.
    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// The most ports which were ever open at the same time.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    fn opened(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opens mocked ports instead of real ones.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    ports: Arc<Mutex<HashMap<String, MockPortKind>>>,
    stats: Arc<MockStats>,
}

impl MockOpener {
    /// An opener without any ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a port named `name` available.
    /// Nothing arrives on it until the returned device sends something.
    pub fn add_port(&self, name: &str) -> MockDevice {
        let (tx, rx) = mpsc::channel();

        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_owned(),
                MockPortKind::Device(Arc::new(Mutex::new(rx))),
            );

        MockDevice { tx }
    }

    /// Opening `name` fails as if we lacked the permission.
    pub fn deny(&self, name: &str) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), MockPortKind::Denied);
    }

    /// What happened to the ports so far.
    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

impl PortOpener for MockOpener {
    fn open(
        &self,
        config: &ConnectionConfig,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialPortIo>, ConnectionError> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);

        match ports.get(&config.port) {
            Some(MockPortKind::Device(input)) => {
                debug!(%config, "Opening mock port");
                self.stats.opened();

                Ok(Box::new(MockPort {
                    input: input.clone(),
                    unread: VecDeque::new(),
                    poll_interval,
                    stats: self.stats.clone(),
                }))
            }
            Some(MockPortKind::Denied) => Err(ConnectionError::PermissionDenied {
                port: config.port.clone(),
                cause: "mock port denies access".into(),
            }),
            None => Err(ConnectionError::PortUnavailable {
                port: config.port.clone(),
                cause: "no such mock port".into(),
            }),
        }
    }
}

struct MockPort {
    input: Arc<Mutex<mpsc::Receiver<MockInput>>>,

    // What did not fit in the caller's buffer last time.
    unread: VecDeque<u8>,

    poll_interval: Duration,
    stats: Arc<MockStats>,
}

impl MockPort {
    fn drain_unread(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.unread.len());

        for (slot, byte) in buf.iter_mut().zip(self.unread.drain(..n)) {
            *slot = byte;
        }

        n
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.unread.is_empty() {
            return Ok(self.drain_unread(buf));
        }

        let input = {
            let receiver = self.input.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv_timeout(self.poll_interval)
        };

        match input {
            Ok(MockInput::Bytes(bytes)) => {
                trace!("Mock port got {} byte(s)", bytes.len());
                self.unread.extend(bytes);
                Ok(self.drain_unread(buf))
            }
            Ok(MockInput::Unplug) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device unplugged",
            )),
            Ok(MockInput::EndOfStream) => Ok(0),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "nothing from mock device",
            )),
            // Every device handle is gone, nothing will ever arrive.
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        self.stats.closed();
    }
}

/// The device side of a mocked port.
#[derive(Debug, Clone)]
pub struct MockDevice {
    tx: mpsc::Sender<MockInput>,
}

impl MockDevice {
    /// Put bytes on the wire.
    /// Returns false if the mocked port no longer exists.
    pub fn send<B: AsRef<[u8]>>(&self, bytes: B) -> bool {
        self.tx
            .send(MockInput::Bytes(bytes.as_ref().to_vec()))
            .is_ok()
    }

    /// The next read fails as if the cable was pulled.
    pub fn unplug(&self) {
        let _ = self.tx.send(MockInput::Unplug);
    }

    /// The next read reports the end of the stream.
    pub fn end(&self) {
        let _ = self.tx.send(MockInput::EndOfStream);
    }

    /// Keep sending humidity/temperature lines like a small sensor board would.
    pub fn spawn_sensor_demo(self, interval: Duration) {
        info!(?interval, "Starting mock sensor");

        thread::spawn(move || {
            for tick in 0u64.. {
                let humidity = 45 + tick % 10;
                let celsius = 20.0 + ((tick * 3) % 7) as f64;
                let fahrenheit = celsius * 9.0 / 5.0 + 32.0;

                let line = format!(
                    "Humidity: {humidity} %    Temperature: {celsius} *C / {fahrenheit:.1} *F\r\n"
                );

                if !self.send(line) {
                    break;
                }

                thread::sleep(interval);
            }
        });
    }
}
