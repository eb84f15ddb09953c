//! Inbound command framing.
//!
//! Commands arrive on a TCP stream terminated by a run of LF bytes (three by
//! default). Reads can split a command anywhere, so each connection keeps a
//! `FrameAccumulator` that collects bytes until a terminator shows up.

use crate::config::FramingConfig;
use crate::error::StationError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

const LF: u8 = b'\n';

/// Splits a byte stream into commands on the LF-run terminator.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    terminator_len: usize,
    max_frame_bytes: usize,
}

impl CommandCodec {
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            terminator_len: config.terminator_len.max(1),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    fn find_terminator(&self, buf: &[u8]) -> Option<usize> {
        let mut run = 0;
        for (i, &b) in buf.iter().enumerate() {
            if b == LF {
                run += 1;
                if run == self.terminator_len {
                    return Some(i + 1 - self.terminator_len);
                }
            } else {
                run = 0;
            }
        }
        None
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(&FramingConfig::default())
    }
}

impl Decoder for CommandCodec {
    type Item = Bytes;
    type Error = StationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, StationError> {
        // A command never starts with LF, whatever the read boundaries were.
        let leading = src.iter().take_while(|&&b| b == LF).count();
        src.advance(leading);

        if let Some(start) = self.find_terminator(src) {
            let frame = src.split_to(start).freeze();
            src.advance(self.terminator_len);
            return Ok(Some(frame));
        }

        if src.len() > self.max_frame_bytes {
            let len = src.len();
            src.clear();
            return Err(StationError::FrameOverflow {
                len,
                limit: self.max_frame_bytes,
            });
        }

        Ok(None)
    }
}

/// Result of feeding one read into an accumulator.
#[derive(Debug, Default)]
pub struct Feed {
    /// Complete commands, terminator stripped, in arrival order
    pub frames: Vec<Bytes>,
    /// Set when an unterminated accumulator overflowed and was dropped
    pub overflow: Option<StationError>,
}

/// Per-connection partial-frame buffer.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf = BytesMut::new();
    }

    /// Append `data` and pull out every command it completes.
    pub fn feed(&mut self, codec: &mut CommandCodec, data: &[u8]) -> Feed {
        self.buf.extend_from_slice(data);
        let mut feed = Feed::default();
        loop {
            match codec.decode(&mut self.buf) {
                Ok(Some(frame)) => feed.frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    feed.overflow = Some(e);
                    break;
                }
            }
        }
        if self.buf.is_empty() {
            // Release the allocation between commands.
            self.buf = BytesMut::new();
        }
        feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut codec = CommandCodec::default();
        let mut acc = FrameAccumulator::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            let feed = acc.feed(&mut codec, chunk);
            assert!(feed.overflow.is_none());
            frames.extend(feed.frames);
        }
        frames
    }

    #[test]
    fn single_delivery() {
        let frames = feed_all(&[b"12\nargs\n\n\n"]);
        assert_eq!(frames, vec![Bytes::from_static(b"12\nargs")]);
    }

    #[test]
    fn split_deliveries_yield_the_same_payload() {
        let command: &[u8] = b"14\nRETRY\n\n\n";
        let whole = feed_all(&[command]);

        for split in 1..command.len() {
            let (a, b) = command.split_at(split);
            assert_eq!(feed_all(&[a, b]), whole, "split at {split}");
        }

        let bytewise: Vec<&[u8]> = command.chunks(1).collect();
        assert_eq!(feed_all(&bytewise), whole);
    }

    #[test]
    fn terminator_split_across_reads() {
        let frames = feed_all(&[b"11\n", b"\n", b"\n"]);
        assert_eq!(frames, vec![Bytes::from_static(b"11")]);
    }

    #[test]
    fn pipelined_commands_in_one_read() {
        let frames = feed_all(&[b"11\n\n\n12\n\n\n13\n\n"]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Bytes::from_static(b"11"));
        assert_eq!(frames[1], Bytes::from_static(b"12"));
    }

    #[test]
    fn extra_lf_does_not_leak_into_next_command() {
        let frames = feed_all(&[b"11\n\n\n\n12\n\n\n"]);
        assert_eq!(frames, vec![Bytes::from_static(b"11"), Bytes::from_static(b"12")]);
    }

    #[test]
    fn overflow_drops_partial_data() {
        let mut codec = CommandCodec::new(&FramingConfig {
            terminator_len: 3,
            max_frame_bytes: 16,
        });
        let mut acc = FrameAccumulator::new();

        let feed = acc.feed(&mut codec, &[b'x'; 17]);
        assert!(feed.frames.is_empty());
        assert!(matches!(
            feed.overflow,
            Some(StationError::FrameOverflow { len: 17, limit: 16 })
        ));
        assert!(acc.is_empty());

        // The connection keeps working afterwards.
        let feed = acc.feed(&mut codec, b"12\n\n\n");
        assert_eq!(feed.frames, vec![Bytes::from_static(b"12")]);
    }

    #[test]
    fn bare_terminator_frames_nothing_however_split() {
        assert!(feed_all(&[b"\n\n\n"]).is_empty());
        assert!(feed_all(&[b"\n", b"\n", b"\n"]).is_empty());
        assert_eq!(
            feed_all(&[b"\n\n", b"\n11\n\n\n"]),
            vec![Bytes::from_static(b"11")]
        );
    }
}
