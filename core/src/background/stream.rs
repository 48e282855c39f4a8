//! Cursor-addressed stream capture for background sessions.

use crate::ring::RingBuffer;

/// Ring cap per stream, in characters.
pub const STREAM_BUFFER_CHARS: usize = 300_000;

/// What a single incremental read produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRead {
    pub text: String,
    /// Data before the read position was dropped from the ring; the gap is
    /// not replayable.
    pub dropped: bool,
    /// More data remains beyond the returned slice.
    pub has_more: bool,
}

/// One capture stream of a background session: a bounded ring plus the read
/// cursor of the (single) consumer.
#[derive(Debug)]
pub struct StreamState {
    ring: RingBuffer,
    cursor: u64,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::new(STREAM_BUFFER_CHARS),
            cursor: 0,
        }
    }

    pub fn append(&mut self, text: &str) {
        self.ring.append(text);
    }

    pub fn total_chars(&self) -> u64 {
        self.ring.total_chars()
    }

    pub fn dropped_chars(&self) -> u64 {
        self.ring.dropped_chars()
    }

    /// Characters appended but not yet consumed by a non-peek read.
    pub fn unread_chars(&self) -> u64 {
        self.ring
            .total_chars()
            .saturating_sub(self.cursor.max(self.ring.dropped_chars()))
    }

    /// Return up to `max_chars` starting at the cursor (clamped past any
    /// dropped prefix). Unless `peek`, the cursor advances to the end of the
    /// returned slice — including past a dropped gap, which is reported but
    /// never replayed.
    pub fn read(&mut self, max_chars: usize, peek: bool) -> StreamRead {
        let dropped = self.cursor < self.ring.dropped_chars();
        let (text, end) = self.ring.read_from(self.cursor, max_chars);
        let has_more = end < self.ring.total_chars();
        if !peek {
            self.cursor = end;
        }
        StreamRead {
            text,
            dropped,
            has_more,
        }
    }
}

/// Decode a byte chunk as UTF-8, carrying an incomplete trailing sequence
/// over to the next chunk instead of mangling it into replacement characters.
pub(crate) fn decode_lossy_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    let mut bytes = std::mem::take(carry);
    bytes.extend_from_slice(chunk);

    match std::str::from_utf8(&bytes) {
        Ok(text) => text.to_string(),
        Err(err) => {
            let valid_up_to = err.valid_up_to();
            // Only hold back a short tail that looks like a split sequence;
            // genuinely invalid bytes are replaced.
            if err.error_len().is_none() && bytes.len() - valid_up_to <= 3 {
                let text = String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned();
                *carry = bytes[valid_up_to..].to_vec();
                text
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        }
    }
}
