use crate::constants::ack;

/// Accumulates decoded bulk text and hands out complete `\n` terminated lines.
///
/// A partial line stays buffered until the chunk carrying its terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Next complete line with surrounding whitespace (including `\r`) removed.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.find('\n')?;
        let line = self.pending[..end].trim().to_string();
        self.pending.drain(..=end);
        Some(line)
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Acknowledgement tokens printed by the MCM during chunked transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Empty,
    Valid,
    /// `FAIL:<message>` holds the message; any other line starting with `FAIL` is kept whole.
    Fail(String),
    Other(String),
}

impl Ack {
    pub fn parse(line: &str) -> Self {
        if let Some(message) = line.strip_prefix(ack::FAIL_WITH_MESSAGE) {
            return Ack::Fail(message.trim().to_string());
        }
        if line.starts_with(ack::FAIL) {
            return Ack::Fail(line.to_string());
        }
        if line == ack::EMPTY {
            Ack::Empty
        } else if line.contains(ack::VALID) {
            Ack::Valid
        } else if line.contains(ack::OK) {
            Ack::Ok
        } else {
            Ack::Other(line.to_string())
        }
    }
}
