//! Scrubs PTY output down to plain text: CRLF becomes LF, OSC/CSI escape
//! sequences (including focus-report noise like `ESC [ I` / `ESC [ O`) are
//! stripped, and control bytes other than tab and newline are dropped.
//!
//! The sanitizer is incremental: an escape sequence split across read chunks
//! is held back until the rest arrives.

#[derive(Debug, Default)]
pub struct PtySanitizer {
    /// Unfinished escape sequence (or a lone CR) carried to the next chunk.
    pending: String,
}

impl PtySanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize one chunk, buffering any incomplete trailing sequence.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.push_str(chunk);

        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\u{1b}' => {
                    let rest = &input[idx..];
                    match consume_escape(rest) {
                        EscapeScan::Complete(len) => {
                            // Skip the sequence.
                            let mut remaining = len - 1;
                            while remaining > 0 {
                                if let Some((_, skipped)) = chars.next() {
                                    remaining -= skipped.len_utf8();
                                } else {
                                    break;
                                }
                            }
                        }
                        EscapeScan::Incomplete => {
                            self.pending = rest.to_string();
                            return out;
                        }
                    }
                }
                '\r' => {
                    // CRLF collapses to LF; a CR at the chunk edge waits to
                    // see whether an LF follows.
                    match chars.peek() {
                        Some((_, '\n')) => {
                            chars.next();
                            out.push('\n');
                        }
                        Some(_) => {}
                        None => {
                            self.pending = "\r".to_string();
                            return out;
                        }
                    }
                }
                '\n' | '\t' => out.push(c),
                c if c.is_control() => {}
                c => out.push(c),
            }
        }
        out
    }

    /// Emit anything still buffered (stream end); a dangling escape prefix is
    /// discarded, a dangling CR is a bare carriage return and is dropped too.
    pub fn flush(&mut self) -> String {
        self.pending.clear();
        String::new()
    }
}

enum EscapeScan {
    /// Sequence complete; byte length including the ESC.
    Complete(usize),
    Incomplete,
}

/// Scan one escape sequence starting at ESC. Handles CSI (`ESC [ … final`),
/// OSC (`ESC ] … BEL` or `ESC ] … ESC \`), and two-byte sequences.
fn consume_escape(input: &str) -> EscapeScan {
    let bytes = input.as_bytes();
    debug_assert_eq!(bytes.first(), Some(&0x1b));
    let Some(&kind) = bytes.get(1) else {
        return EscapeScan::Incomplete;
    };
    match kind {
        b'[' => {
            // CSI: parameter/intermediate bytes 0x20..=0x3f, final 0x40..=0x7e.
            let mut i = 2;
            while let Some(&b) = bytes.get(i) {
                if (0x40..=0x7e).contains(&b) {
                    return EscapeScan::Complete(i + 1);
                }
                if !(0x20..=0x3f).contains(&b) {
                    // Malformed; drop the ESC [ prefix only.
                    return EscapeScan::Complete(i);
                }
                i += 1;
            }
            EscapeScan::Incomplete
        }
        b']' => {
            // OSC: terminated by BEL or ST (ESC \).
            let mut i = 2;
            while let Some(&b) = bytes.get(i) {
                if b == 0x07 {
                    return EscapeScan::Complete(i + 1);
                }
                if b == 0x1b {
                    return match bytes.get(i + 1) {
                        Some(b'\\') => EscapeScan::Complete(i + 2),
                        Some(_) => EscapeScan::Complete(i),
                        None => EscapeScan::Incomplete,
                    };
                }
                i += 1;
            }
            EscapeScan::Incomplete
        }
        _ => EscapeScan::Complete(2),
    }
}
