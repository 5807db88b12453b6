//! Append-only, sequence-numbered record of a session's output.

use std::ops::Range;

use bytes::Bytes;

/// One immutable slice of session output.
///
/// Sequence numbers start at 0, increase by exactly 1 per append, and
/// are never reused. `offset` is the absolute position of the chunk's
/// first byte in the session history, so byte ranges can be resolved
/// without summing lengths.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Per-session sequence number, gap-free from 0.
    pub seq: u64,

    /// Absolute byte offset of the first byte of `bytes`.
    pub offset: u64,

    /// Raw bytes as received from the remote channel. Line terminators
    /// are preserved exactly as the remote emitted them.
    pub bytes: Bytes,

    /// Whether the prompt matcher confirmed a boundary in the delivery
    /// that produced this chunk.
    pub ends_with_prompt: bool,
}

/// The authoritative ordered history of one session.
///
/// The buffer itself is not synchronized; the broadcast hub owns it
/// behind its lock so appends and observer notification are a single
/// atomic step.
#[derive(Debug, Default)]
pub struct HistoryBuffer {
    chunks: Vec<OutputChunk>,
    total: u64,
}

impl HistoryBuffer {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return a clone of it (cheap: `Bytes` is
    /// reference-counted).
    pub fn append(&mut self, bytes: Bytes, ends_with_prompt: bool) -> OutputChunk {
        let chunk = OutputChunk {
            seq: self.chunks.len() as u64,
            offset: self.total,
            bytes,
            ends_with_prompt,
        };
        self.total += chunk.bytes.len() as u64;
        self.chunks.push(chunk.clone());
        chunk
    }

    /// Full ordered replay from sequence 0.
    pub fn replay(&self) -> Vec<OutputChunk> {
        self.chunks.clone()
    }

    /// Iterate chunks in order without cloning.
    pub fn iter(&self) -> impl Iterator<Item = &OutputChunk> {
        self.chunks.iter()
    }

    /// Number of chunks recorded.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether any chunk has been recorded.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes recorded.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Extract a byte range from the history, crossing chunk borders as
    /// needed. Out-of-range ends are clamped.
    pub fn slice(&self, range: Range<u64>) -> Vec<u8> {
        let start = range.start.min(self.total);
        let end = range.end.min(self.total);
        if start >= end {
            return Vec::new();
        }

        let mut out = Vec::with_capacity((end - start) as usize);
        let first = self.chunks.partition_point(|c| c.offset + c.bytes.len() as u64 <= start);
        for chunk in &self.chunks[first..] {
            if chunk.offset >= end {
                break;
            }
            let lo = start.saturating_sub(chunk.offset) as usize;
            let hi = ((end - chunk.offset) as usize).min(chunk.bytes.len());
            out.extend_from_slice(&chunk.bytes[lo..hi]);
        }
        out
    }
}
