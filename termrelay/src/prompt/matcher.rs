//! Boundary detection over the raw output stream.
//!
//! The matcher scans for one injected prompt literal and reports the
//! absolute stream offset of every confirmed occurrence. A literal split
//! across two deliveries is still found: the last `len - 1` bytes of the
//! stream are carried over into the next scan, and an occurrence is only
//! ever reported by the feed in which its final byte arrived.

use memchr::memmem;

/// Recognizes prompt boundaries in a session's output byte stream.
///
/// A match counts as a boundary only when the literal sits at the start
/// of a line (immediately after `\n`, or at stream offset 0). Prompt-like
/// text in the middle of a line — including the echoed initialization
/// command that set the prompt — is never a boundary.
///
/// The matcher never synthesizes boundaries: it reports only what was
/// actually observed in the stream. Output that reproduces the exact
/// literal at the start of a line will still produce a false boundary;
/// the injected literal is chosen to make that unlikely, not impossible.
#[derive(Debug)]
pub struct PromptMatcher {
    finder: memmem::Finder<'static>,
    literal_len: usize,

    /// Unmatched tail of the previous feed, always shorter than the literal.
    carry: Vec<u8>,

    /// Absolute stream offset of `carry[0]`.
    carry_abs: u64,

    /// The byte immediately preceding the carry; `None` at stream start.
    /// Needed to anchor-check a literal that begins exactly at the carry.
    prev_before_carry: Option<u8>,

    /// Total bytes fed so far.
    consumed: u64,
}

impl PromptMatcher {
    /// Create a matcher for the given prompt literal.
    ///
    /// # Panics
    ///
    /// Panics if `literal` is empty.
    pub fn new(literal: &[u8]) -> Self {
        assert!(!literal.is_empty(), "prompt literal must be non-empty");
        Self {
            finder: memmem::Finder::new(literal).into_owned(),
            literal_len: literal.len(),
            carry: Vec::new(),
            carry_abs: 0,
            prev_before_carry: None,
            consumed: 0,
        }
    }

    /// Scan a newly received delivery.
    ///
    /// Returns the absolute stream offsets (relative to everything ever
    /// fed) at which a line-anchored prompt literal begins. Each actual
    /// occurrence is reported exactly once across all calls.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u64> {
        if data.is_empty() {
            return Vec::new();
        }

        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(data);
        let window_abs = self.carry_abs;

        let mut boundaries = Vec::new();
        for i in self.finder.find_iter(&window) {
            // The carry is shorter than the literal, so every occurrence
            // ends inside the new data and cannot have been reported before.
            let at_line_start = if i == 0 {
                matches!(self.prev_before_carry, None | Some(b'\n'))
            } else {
                window[i - 1] == b'\n'
            };
            if at_line_start {
                boundaries.push(window_abs + i as u64);
            }
        }

        self.consumed += data.len() as u64;

        let keep = window.len().min(self.literal_len.saturating_sub(1));
        if window.len() > keep {
            self.prev_before_carry = Some(window[window.len() - keep - 1]);
        }
        self.carry = window.split_off(window.len() - keep);
        self.carry_abs = self.consumed - keep as u64;

        boundaries
    }

    /// Total number of bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Length of the prompt literal in bytes.
    pub fn literal_len(&self) -> usize {
        self.literal_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIT: &[u8] = b"__trl_ops@db1__$ ";

    #[test]
    fn test_match_at_stream_start() {
        let mut m = PromptMatcher::new(LIT);
        assert_eq!(m.feed(LIT), vec![0]);
    }

    #[test]
    fn test_match_after_newline() {
        let mut m = PromptMatcher::new(LIT);
        let mut data = b"uptime\r\n 12:00 up 3 days\r\n".to_vec();
        let at = data.len() as u64;
        data.extend_from_slice(LIT);
        assert_eq!(m.feed(&data), vec![at]);
    }

    #[test]
    fn test_mid_line_occurrence_is_not_a_boundary() {
        let mut m = PromptMatcher::new(LIT);
        let mut data = b"export PS1=".to_vec();
        data.extend_from_slice(LIT);
        data.extend_from_slice(b"\r\n");
        assert!(m.feed(&data).is_empty());
    }

    #[test]
    fn test_literal_split_across_feeds() {
        let mut m = PromptMatcher::new(LIT);
        let mut stream = b"ok\r\n".to_vec();
        stream.extend_from_slice(LIT);
        let (a, b) = stream.split_at(stream.len() - 5);
        assert!(m.feed(a).is_empty());
        assert_eq!(m.feed(b), vec![4]);
    }

    #[test]
    fn test_anchor_newline_split_across_feeds() {
        let mut m = PromptMatcher::new(LIT);
        assert!(m.feed(b"done\r\n").is_empty());
        assert_eq!(m.feed(LIT), vec![6]);
    }

    #[test]
    fn test_multiple_boundaries_in_one_feed() {
        let mut m = PromptMatcher::new(LIT);
        let mut data = Vec::new();
        data.extend_from_slice(LIT);
        data.extend_from_slice(b"pwd\r\n/home/ops\r\n");
        let second = data.len() as u64;
        data.extend_from_slice(LIT);
        assert_eq!(m.feed(&data), vec![0, second]);
    }

    #[test]
    fn test_occurrence_reported_exactly_once() {
        let mut m = PromptMatcher::new(LIT);
        let mut data = b"x\r\n".to_vec();
        data.extend_from_slice(LIT);
        assert_eq!(m.feed(&data).len(), 1);
        // Subsequent unrelated feeds must not re-report the carry tail.
        assert!(m.feed(b"ls\r\n").is_empty());
        assert!(m.feed(b"file\r\n").is_empty());
    }

    #[test]
    fn test_offsets_are_absolute_across_feeds() {
        let mut m = PromptMatcher::new(LIT);
        assert!(m.feed(b"banner line one\r\n").is_empty());
        assert!(m.feed(b"banner line two\r\n").is_empty());
        let base = m.consumed();
        assert_eq!(m.feed(LIT), vec![base]);
    }

    #[test]
    fn test_single_byte_literal() {
        let mut m = PromptMatcher::new(b"%");
        assert_eq!(m.feed(b"%"), vec![0]);
        assert!(m.feed(b"100% done\r\n").is_empty());
        assert_eq!(m.feed(b"%"), vec![12]);
    }
}
