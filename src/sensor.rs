//! Decodes the humidity/temperature lines a sensor board prints, e.g.
//!
//! ```text
//! Humidity: 50 %    Temperature: 24 *C / 75.2 *F
//! ```

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::Line;

const HUMIDITY_KEY: &str = "Humidity:";
const TEMPERATURE_KEY: &str = "Temperature:";

/// One humidity/temperature reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Relative humidity, in percent.
    pub humidity: f64,

    /// Degrees Celsius.
    pub temperature: f64,

    /// When the line was decoded.
    pub timestamp: DateTime<Utc>,
}

/// Change since the previous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorDelta {
    /// Change in percent.
    pub humidity: f64,

    /// Change in degrees Celsius.
    pub temperature: f64,
}

/// A reading and how it changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    /// The new reading.
    pub reading: SensorReading,

    /// Compared to the previous reading, zero if there was none.
    pub delta: SensorDelta,
}

impl SensorUpdate {
    /// E.g. `50.00 %`.
    pub fn humidity_text(&self) -> String {
        format!("{:.2} %", self.reading.humidity)
    }

    /// E.g. `24.00 °C`.
    pub fn temperature_text(&self) -> String {
        format!("{:.2} °C", self.reading.temperature)
    }

    /// E.g. `+2.00 %`.
    pub fn humidity_delta_text(&self) -> String {
        format!("{:+.2} %", self.delta.humidity)
    }

    /// E.g. `-0.50 °C`.
    pub fn temperature_delta_text(&self) -> String {
        format!("{:+.2} °C", self.delta.temperature)
    }
}

impl Display for SensorUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "humidity {} ({}), temperature {} ({})",
            self.humidity_text(),
            self.humidity_delta_text(),
            self.temperature_text(),
            self.temperature_delta_text()
        )
    }
}

/// What [`SensorDecoder::parse`] made of a line.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorParse {
    /// The line was a reading.
    Reading(SensorUpdate),

    /// Not a reading. Not an error either, the line is just not for us.
    NotRecognized,
}

/// Turns lines into readings, remembering the last one for deltas.
#[derive(Debug, Default, Clone)]
pub struct SensorDecoder {
    previous: Option<(f64, f64)>,
}

impl SensorDecoder {
    /// A decoder which has not seen a reading yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to decode a reading.
    pub fn parse(&mut self, line: &Line) -> SensorParse {
        let Some((humidity, temperature)) = parse_values(line.as_str()) else {
            return SensorParse::NotRecognized;
        };

        let delta = match self.previous {
            Some((last_humidity, last_temperature)) => SensorDelta {
                humidity: humidity - last_humidity,
                temperature: temperature - last_temperature,
            },
            None => SensorDelta::default(),
        };

        self.previous = Some((humidity, temperature));

        SensorParse::Reading(SensorUpdate {
            reading: SensorReading {
                humidity,
                temperature,
                timestamp: Utc::now(),
            },
            delta,
        })
    }

    /// Forget the previous reading, e.g. because a different device is connected now.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// The first `Humidity:` with a number after it, then the last `Temperature:`
/// with a number after that.
fn parse_values(text: &str) -> Option<(f64, f64)> {
    let (humidity, temperature) = text.match_indices(HUMIDITY_KEY).find_map(|(start, key)| {
        let (humidity, rest) = number_at(&text[start + key.len()..])?;

        let temperature = rest
            .rmatch_indices(TEMPERATURE_KEY)
            .find_map(|(start, key)| number_at(&rest[start + key.len()..]))?
            .0;

        Some((humidity, temperature))
    })?;

    Some((humidity.parse().ok()?, temperature.parse().ok()?))
}

/// Skips whitespace, then returns the run of digits and dots there,
/// and the text after that run.
fn number_at(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();

    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());

    if end == 0 {
        None
    } else {
        Some(text.split_at(end))
    }
}
