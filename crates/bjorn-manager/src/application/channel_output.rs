//! Line reassembly for output read from remote channels in arbitrary chunks.

/// Longest line kept in memory; an unterminated tail this long is emitted as
/// a line of its own.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Splits a byte stream into lines.
///
/// Chunks may end mid-line (or mid UTF-8 sequence); the tail is kept until
/// the next newline or [`LineSplitter::finish`].  A trailing `\r` from PTY
/// output is removed.  Tails never grow past [`MAX_LINE_LEN`].
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Appends `chunk` and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(decode(&raw[..raw.len() - 1]));
        }
        while self.partial.len() >= MAX_LINE_LEN {
            let raw: Vec<u8> = self.partial.drain(..MAX_LINE_LEN).collect();
            lines.push(decode(&raw));
        }
        lines
    }

    /// Returns the unterminated tail, if any, and empties the buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.partial);
        Some(decode(&tail))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}
