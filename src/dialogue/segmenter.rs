//! Splits a streaming reply into speakable segments
//!
//! Boundaries, checked in order:
//! - sentence punctuation (`. ! ? …`) followed by whitespace, or any of
//!   `。！？` and newline immediately
//! - clause punctuation (`, ; :` followed by whitespace, or `，；：`) once at
//!   least `clause_min_chars` are pending
//! - `max_pending_chars` without punctuation, cut at the last whitespace
//!
//! Punctuation at the very end of the pending text is held until more text
//! arrives (or the reply finishes), so `3.` + `5 degrees` is not split.

/// Segmenter tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Pending characters required before clause punctuation closes a segment
    pub clause_min_chars: usize,
    /// Pending characters after which a segment is cut regardless of punctuation
    pub max_pending_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            clause_min_chars: 40,
            max_pending_chars: 160,
        }
    }
}

/// A sentence- or clause-sized slice of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Position in the reply; strictly increasing from 0
    pub seq: u64,
    pub text: String,
}

/// Incremental segmenter; one per reply
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
    pending: String,
    next_seq: u64,
}

impl Segmenter {
    #[must_use]
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            pending: String::new(),
            next_seq: 0,
        }
    }

    /// Append a delta and return every segment it completes
    pub fn push(&mut self, delta: &str) -> Vec<TextSegment> {
        self.pending.push_str(delta);

        let mut out = Vec::new();
        while let Some(cut) = self.find_boundary() {
            let rest = self.pending.split_off(cut);
            let head = std::mem::replace(&mut self.pending, rest.trim_start().to_string());
            if let Some(segment) = self.emit(&head) {
                out.push(segment);
            }
        }
        out
    }

    /// Flush whatever is pending as the final segment
    pub fn finish(&mut self) -> Option<TextSegment> {
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest)
    }

    /// Segments emitted so far
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.next_seq
    }

    fn emit(&mut self, text: &str) -> Option<TextSegment> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let segment = TextSegment {
            seq: self.next_seq,
            text: text.to_string(),
        };
        self.next_seq += 1;
        tracing::trace!(seq = segment.seq, text = %segment.text, "segment ready");
        Some(segment)
    }

    /// Byte offset just past the first boundary in `pending`
    fn find_boundary(&self) -> Option<usize> {
        let mut chars = self.pending.char_indices().peekable();
        let mut count = 0;
        let mut last_space = None;

        while let Some((i, c)) = chars.next() {
            count += 1;
            let end = i + c.len_utf8();
            let next = chars.peek().map(|&(_, n)| n);

            if c.is_whitespace() {
                last_space = Some(i);
            }

            if is_immediate_terminal(c) {
                return Some(end);
            }

            if is_terminal(c) && next.is_some_and(char::is_whitespace) {
                return Some(end);
            }

            if count >= self.config.clause_min_chars {
                if is_wide_clause(c) {
                    return Some(end);
                }
                if is_clause(c) && next.is_some_and(char::is_whitespace) {
                    return Some(end);
                }
            }

            if count >= self.config.max_pending_chars && next.is_some() {
                return Some(match last_space {
                    Some(space) if space > 0 => space,
                    _ => end,
                });
            }
        }

        None
    }
}

const fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

const fn is_immediate_terminal(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '\n')
}

const fn is_clause(c: char) -> bool {
    matches!(c, ',' | ';' | ':')
}

const fn is_wide_clause(c: char) -> bool {
    matches!(c, '，' | '；' | '：')
}

/// Decide from the start of a reply whether it is structured data
///
/// Returns `Some(true)` for a JSON object or a fenced JSON block,
/// `Some(false)` for prose, and `None` while the start is still ambiguous.
#[must_use]
pub fn classify_reply_start(text: &str) -> Option<bool> {
    const FENCE: &str = "```json";

    let start = text.trim_start();
    if start.is_empty() {
        return None;
    }
    if start.starts_with('{') || start.starts_with(FENCE) {
        return Some(true);
    }
    if FENCE.starts_with(start) {
        return None;
    }
    Some(false)
}
