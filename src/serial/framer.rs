use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::serial::{error::StreamError, Line};

/// Splits a byte stream on a delimiter (by default `\n`) and decodes each line.
///
/// Bytes after the last delimiter are kept until more data arrives.
/// A `\r` directly in front of the delimiter is dropped along with it.
#[derive(Debug, Clone)]
pub struct LineFramer {
    /// Bytes not yet yielded as lines.
    pending: BytesMut,

    /// How far we have looked for a delimiter into `pending`.
    cursor: usize,

    /// This delimiter is not included in the yielded lines.
    delimiter: u8,
}

impl LineFramer {
    /// Create a framer splitting on the given delimiter.
    pub fn new(delimiter: u8) -> Self {
        Self {
            pending: BytesMut::new(),
            cursor: 0,
            delimiter,
        }
    }

    /// Add bytes and iterate the lines they complete.
    ///
    /// The iterator is lazy. Lines it was not asked for stay buffered
    /// and come out of the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Lines<'_> {
        self.pending.extend_from_slice(bytes);

        Lines { framer: self }
    }

    /// The stream ended: drain what is buffered, one line per call.
    ///
    /// Complete lines a [`Lines`] iterator was not asked for come out first,
    /// then the unterminated tail, if any, as the last line.
    /// Call until it returns `None`.
    pub fn finish(&mut self) -> Option<Line> {
        if let Some(line) = self.next_line() {
            return Some(line);
        }

        if self.pending.is_empty() {
            return None;
        }

        let rest = self.pending.split();
        self.cursor = 0;

        Some(Self::decode_line(&rest))
    }

    /// Throw away any partial line.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.cursor = 0;
    }

    /// How many bytes are waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn next_line(&mut self) -> Option<Line> {
        let position = self.pending[self.cursor..]
            .iter()
            .position(|&byte| byte == self.delimiter);

        match position {
            Some(position) => {
                // Since we might "start late" in the buffer (from the cursor),
                // the "global" position within the buffer has to be calculated.
                let actual_position = self.cursor + position;
                self.cursor = 0;

                let line = self.pending.split_to(actual_position);

                // Discard the delimiter.
                self.pending.advance(1);

                Some(Self::decode_line(&line))
            }
            None => {
                // No need to re-read these bytes next time.
                self.cursor = self.pending.len();
                None
            }
        }
    }

    fn decode_line(bytes: &[u8]) -> Line {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);

        Line::from_bytes(bytes)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(b'\n')
    }
}

/// Lines completed by a call to [`LineFramer::feed`].
#[derive(Debug)]
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Line;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_line()
    }
}

impl Decoder for LineFramer {
    type Item = Line;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Bytes handed to us are ours from now on.
        if !src.is_empty() {
            self.pending.extend_from_slice(src);
            src.clear();
        }

        Ok(self.next_line())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            self.pending.extend_from_slice(src);
            src.clear();
        }

        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use tokio_util::codec::FramedRead;

    use super::*;

    fn texts(lines: impl IntoIterator<Item = Line>) -> Vec<String> {
        lines.into_iter().map(|l| l.as_str().to_owned()).collect()
    }

    #[test]
    fn simple() {
        let mut framer = LineFramer::default();

        let lines = texts(framer.feed(b"Hello\nWorld\n"));
        assert_eq!(lines, vec!["Hello", "World"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn split_across_feeds() {
        let mut framer = LineFramer::default();

        assert_eq!(framer.feed(b"Hel").count(), 0);
        assert_eq!(texts(framer.feed(b"lo\nWo")), vec!["Hello"]);
        assert_eq!(framer.pending_len(), 2);
        assert_eq!(texts(framer.feed(b"rld\n")), vec!["World"]);
    }

    #[test]
    fn chunking_does_not_matter() {
        let input: &[u8] = b"Humidity: 50 %\r\n\nTemperature\xff: 24\nfirst\nsecond\r\ntail";

        let mut whole = LineFramer::default();
        let mut expected: Vec<Line> = whole.feed(input).collect();
        expected.extend(whole.finish());

        for chunk_size in 1..input.len() {
            let mut framer = LineFramer::default();
            let mut got = vec![];

            for chunk in input.chunks(chunk_size) {
                got.extend(framer.feed(chunk));
            }
            got.extend(framer.finish());

            assert_eq!(got, expected, "chunk size {chunk_size}");
        }

        assert_eq!(expected.len(), 6);
    }

    #[test]
    fn empty_lines_are_kept() {
        let mut framer = LineFramer::default();

        let lines = texts(framer.feed(b"a\n\n\nb\n"));
        assert_eq!(lines, vec!["a", "", "", "b"]);
    }

    #[test]
    fn bad_utf8_gives_marked_line() {
        let mut framer = LineFramer::default();

        let lines: Vec<Line> = framer.feed(b"ok\n\xc3\x28\nok again\n").collect();

        assert_eq!(lines.len(), 3);
        assert!(!lines[0].decode_failed());
        assert!(lines[1].decode_failed());
        assert!(!lines[2].decode_failed());
    }

    #[test]
    fn tail_flushed_on_finish() {
        let mut framer = LineFramer::default();

        assert_eq!(framer.feed(b"no newline").count(), 0);
        assert_eq!(framer.finish(), Some(Line::from("no newline")));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn nothing_to_flush() {
        let mut framer = LineFramer::default();

        assert_eq!(framer.feed(b"line\n").count(), 1);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn lazy_iteration_keeps_the_rest() {
        let mut framer = LineFramer::default();

        let first = framer.feed(b"one\ntwo\nthree\n").next();
        assert_eq!(first, Some(Line::from("one")));

        assert_eq!(texts(framer.feed(b"")), vec!["two", "three"]);
    }

    #[test]
    fn finish_drains_unconsumed_lines_then_tail() {
        let mut framer = LineFramer::default();

        assert_eq!(framer.feed(b"one\ntwo\nthree\ntail").next(), Some(Line::from("one")));

        let rest = texts(std::iter::from_fn(|| framer.finish()));
        assert_eq!(rest, vec!["two", "three", "tail"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn reset_discards_partial_line() {
        let mut framer = LineFramer::default();

        assert_eq!(framer.feed(b"stale par").count(), 0);
        framer.reset();

        assert_eq!(texts(framer.feed(b"fresh\n")), vec!["fresh"]);
    }

    #[test]
    fn custom_delimiter() {
        let mut framer = LineFramer::new(b';');

        assert_eq!(texts(framer.feed(b"a;b;")), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn as_codec() {
        let input: &[u8] = b"first\nsecond\nunterminated";

        let lines: Vec<Line> = FramedRead::new(input, LineFramer::default())
            .map(|line| line.expect("framing a slice does not fail"))
            .collect()
            .await;

        assert_eq!(texts(lines), vec!["first", "second", "unterminated"]);
    }
}
