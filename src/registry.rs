//! Fan-out of [`Line`]s to any number of subscribers.
//!
//! A broadcast works on a snapshot of the subscribers taken when it starts,
//! and never waits on a subscriber: every delivery is a non-blocking send into
//! a bounded queue. A full queue means the line is dropped for that subscriber only.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::serial::Line;

/// Identifies a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first group is plenty to tell subscribers apart in logs.
        let id = self.0.to_string();
        write!(f, "{}", id.split('-').next().unwrap_or(&id))
    }
}

/// The result of handing a line to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The subscriber has the line.
    Delivered,

    /// The subscriber had no room, so this line was dropped.
    Dropped,

    /// The subscriber is gone and should be removed.
    Gone,
}

/// Something which wants the lines.
///
/// Implementations must not block.
pub trait Subscriber: Send + Sync {
    /// A new line.
    fn receive(&self, line: &Line) -> Delivery;

    /// No more lines will arrive.
    fn end_of_stream(&self);
}

/// A subscriber feeding a bounded channel, read via a [`Subscription`].
#[derive(Debug)]
pub struct ChannelSubscriber {
    // Taken on end of stream, which closes the channel.
    tx: Mutex<Option<mpsc::Sender<Line>>>,
}

impl ChannelSubscriber {
    fn new(tx: mpsc::Sender<Line>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn receive(&self, line: &Line) -> Delivery {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(tx) = tx.as_ref() else {
            return Delivery::Gone;
        };

        match tx.try_send(line.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    fn end_of_stream(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// What [`Subscription::try_recv`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRecv {
    /// The oldest queued line.
    Line(Line),

    /// Nothing queued right now.
    Empty,

    /// Nothing queued, and nothing ever will be.
    Closed,
}

/// The receiving end of a subscription.
///
/// Lines arrive in the order they were read.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Line>,
}

impl Subscription {
    /// The id to unsubscribe with.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The next line.
    /// `None` when the stream ended or we were unsubscribed.
    pub async fn recv(&mut self) -> Option<Line> {
        self.rx.recv().await
    }

    /// The next line if one is queued, without waiting.
    pub fn try_recv(&mut self) -> TryRecv {
        match self.rx.try_recv() {
            Ok(line) => TryRecv::Line(line),
            Err(mpsc::error::TryRecvError::Empty) => TryRecv::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => TryRecv::Closed,
        }
    }

    /// Use the subscription as a stream of lines.
    pub fn into_stream(self) -> ReceiverStream<Line> {
        ReceiverStream::new(self.rx)
    }
}

struct Entry {
    subscriber: Arc<dyn Subscriber>,

    // Drops in a row.
    saturation: AtomicUsize,
}

/// The set of subscribers lines are broadcast to.
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Entry>>>,

    /// Queue size of subscribers made via [`SubscriberRegistry::subscribe`].
    queue_capacity: usize,

    /// Drops in a row before a subscriber is removed.
    max_saturation: usize,
}

impl SubscriberRegistry {
    /// A registry without subscribers.
    ///
    /// Zero capacity or saturation limits are bumped to one.
    pub fn new(queue_capacity: usize, max_saturation: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            max_saturation: max_saturation.max(1),
        }
    }

    /// Register a subscriber.
    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId::new();

        self.lock().insert(
            id,
            Arc::new(Entry {
                subscriber,
                saturation: AtomicUsize::new(0),
            }),
        );
        debug!(%id, "Subscriber added");

        id
    }

    /// Register a new channel subscriber and get its receiving end.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.add(Arc::new(ChannelSubscriber::new(tx)));

        Subscription { id, rx }
    }

    /// Unregister a subscriber.
    /// Returns false if it was not registered (anymore).
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id);

        match removed {
            Some(entry) => {
                debug!(%id, "Subscriber removed");
                entry.subscriber.end_of_stream();
                true
            }
            None => false,
        }
    }

    /// Hand the line to every current subscriber.
    ///
    /// Subscribers which are gone, or which dropped too many lines in a row, are removed.
    pub fn broadcast(&self, line: &Line) {
        let snapshot: Vec<(SubscriberId, Arc<Entry>)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut to_remove = vec![];

        for (id, entry) in &snapshot {
            match entry.subscriber.receive(line) {
                Delivery::Delivered => {
                    entry.saturation.store(0, Ordering::Relaxed);
                }
                Delivery::Dropped => {
                    let drops = entry.saturation.fetch_add(1, Ordering::Relaxed) + 1;

                    if drops >= self.max_saturation {
                        warn!(%id, %drops, "Subscriber keeps falling behind, removing it");
                        to_remove.push(*id);
                    } else {
                        trace!(%id, %drops, "Subscriber queue full, line dropped");
                    }
                }
                Delivery::Gone => {
                    debug!(%id, "Subscriber gone");
                    to_remove.push(*id);
                }
            }
        }

        for id in to_remove {
            self.remove(id);
        }

        trace!("Broadcasted {line} to {} subscriber(s)", snapshot.len());
    }

    /// Tell every subscriber the stream ended, and forget them.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();

        for (id, entry) in drained {
            debug!(%id, "Ending stream for subscriber");
            entry.subscriber.end_of_stream();
        }
    }

    /// How many subscribers there are.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Are there no subscribers?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Arc<Entry>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(256, 64)
    }
}
