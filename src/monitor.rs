//! A local consumer which keeps a humidity/temperature panel up to date.

use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::{
    bridge::BridgeHandle,
    registry::Subscription,
    sensor::{SensorDecoder, SensorParse, SensorUpdate},
    serial::Line,
};

/// Decodes sensor lines from a bridge subscription.
pub struct Monitor {
    subscription: Subscription,

    // The connection the decoder's previous reading is from.
    generation: u64,

    decoder: SensorDecoder,
    panel: watch::Sender<Option<SensorUpdate>>,
}

impl Monitor {
    /// Subscribe to the bridge.
    /// The returned receiver always holds the latest decoded reading.
    pub fn new(bridge: &BridgeHandle) -> (Self, watch::Receiver<Option<SensorUpdate>>) {
        let (panel_tx, panel_rx) = watch::channel(None);

        let monitor = Self {
            subscription: bridge.subscribe(),
            generation: bridge.status().generation,
            decoder: SensorDecoder::new(),
            panel: panel_tx,
        };

        (monitor, panel_rx)
    }

    /// Process lines until the subscription ends.
    pub async fn run(mut self) {
        info!("Monitor running");

        while let Some(line) = self.subscription.recv().await {
            self.handle_line(&line);
        }

        info!("Monitor stopped");
    }

    fn handle_line(&mut self, line: &Line) {
        let generation = line.generation();

        if generation < self.generation {
            trace!(%line, %generation, "Line from a previous connection, skipping");
            return;
        }

        if generation > self.generation {
            debug!(%generation, "New connection, forgetting previous reading");
            self.generation = generation;
            self.decoder.reset();
        }

        match self.decoder.parse(line) {
            SensorParse::Reading(update) => {
                info!(%update, "Sensor");
                self.panel.send_replace(Some(update));
            }
            SensorParse::NotRecognized => {
                debug!(%line, "Received unrecognized data");
            }
        }
    }
}
