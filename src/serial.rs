use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

/// Serial connection related errors.
pub mod error;

/// The serial connection and the ports it opens.
pub mod connection;

/// Splits incoming bytes into [`Line`]s.
pub mod framer;

/// A single decoded line read from the serial device.
///
/// The line terminator is not part of the text.
/// Cloning is cheap, so every subscriber gets its own copy.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Line {
    text: Arc<str>,

    /// Set if the bytes were not valid UTF-8.
    /// The text then holds a lossy decoding.
    decode_failed: bool,

    /// Which connection of the bridge the line was read on, see [`crate::bridge::Status::generation`].
    #[serde(default)]
    generation: u64,
}

impl Line {
    /// Decode a line from bytes.
    /// Bad UTF-8 does not fail: the line is marked instead, and the text is decoded lossily.
    pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> Self {
        let bytes = bytes.as_ref();

        match std::str::from_utf8(bytes) {
            Ok(text) => Self {
                text: text.into(),
                decode_failed: false,
                generation: 0,
            },
            Err(_) => Self {
                text: String::from_utf8_lossy(bytes).into(),
                decode_failed: true,
                generation: 0,
            },
        }
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Did decoding the bytes of this line fail?
    pub fn decode_failed(&self) -> bool {
        self.decode_failed
    }

    /// Was there nothing between the terminators?
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The connection generation this line was read on.
    /// Zero for lines which did not come through a bridge.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The same line, marked as read on the given connection generation.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

impl<T: AsRef<str>> From<T> for Line {
    fn from(string_like: T) -> Self {
        Self {
            text: string_like.as_ref().into(),
            decode_failed: false,
            generation: 0,
        }
    }
}

impl Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.text.chars().take(48).collect::<String>();

        if self.decode_failed {
            write!(f, "{} (bad utf8)", s.trim())
        } else {
            write!(f, "{}", s.trim())
        }
    }
}
