//! Output framing for the relay.
//!
//! Shell output is forwarded to consumers as text messages with no header or
//! length prefix. The PTY hands out bytes at arbitrary boundaries, so a
//! multi-byte UTF-8 character can be split across two reads. [`OutputFramer`]
//! holds back an incomplete trailing sequence (at most three bytes) until the
//! rest of it arrives, and replaces genuinely invalid bytes with U+FFFD.

/// Maximum number of bytes held back between pushes.
pub const MAX_CARRY: usize = 3;

/// Converts drained output bytes into outbound text messages.
#[derive(Debug, Default)]
pub struct OutputFramer {
    carry: Vec<u8>,
}

impl OutputFramer {
    /// Create a framer with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame a chunk of output.
    ///
    /// Returns `None` when there is nothing complete to send yet.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        let split = incomplete_tail_start(&buf);
        self.carry = buf.split_off(split);

        if buf.is_empty() {
            return None;
        }
        Some(decode_lossy(buf))
    }

    /// Flush whatever is held back, replacing an unfinished sequence.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        Some(decode_lossy(std::mem::take(&mut self.carry)))
    }

    /// Number of bytes currently held back.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn decode_lossy(buf: Vec<u8>) -> String {
    match String::from_utf8(buf) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Index where an incomplete UTF-8 sequence at the end of `buf` begins, or
/// `buf.len()` if the buffer does not end mid-character.
fn incomplete_tail_start(buf: &[u8]) -> usize {
    let len = buf.len();
    for i in (len.saturating_sub(MAX_CARRY)..len).rev() {
        let b = buf[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            b if b & 0x80 == 0x00 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if len - i < needed { i } else { len };
    }
    len
}
