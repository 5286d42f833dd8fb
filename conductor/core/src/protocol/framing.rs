//! Framing Decoder
//!
//! Turns the agent's raw stdout bytes into [`AgentEvent`]s.
//!
//! # Stream Format
//!
//! ```text
//! [daemon] Browser started. Provider: google, Model: gemini-2.5-flash\n   <- readiness sentinel
//! [agent] Running: open example.com\n                                     <- agent narration
//! [error] Page.navigate timed out\n                                       <- error tag
//! __DONE__\n                                                              <- completion marker
//! ```
//!
//! The decoded text is split on the literal completion marker; each marker
//! becomes a standalone `TaskDone` positioned exactly where it sat in the
//! stream. Text between markers is split into lines and each line is
//! classified through the ordered tag table.
//!
//! A line is only emitted once it is terminated (`\n`, `\r`, marker, or
//! [`FramingDecoder::finish`] at end of stream). Unterminated text is held
//! back, so the event sequence does not depend on how the bytes were
//! chunked, even when a multi-byte character or the marker itself straddles
//! two reads. A bare `\r` ends a line so that progress output redrawn in
//! place shows up as it happens.
//!
//! Held-back text is bounded by [`FramingConfig::max_line_length`]: a line
//! with no terminator within that many bytes is cut there and emitted as is.
//! Each push only searches text it has not searched before.
//!
//! The marker is matched literally. If legitimate agent text ever contains
//! it, the line is split there; there is no escaping mechanism.

use crate::events::{AgentEvent, EventKind};

/// Default completion marker printed by the agent after every task
pub const DEFAULT_COMPLETION_MARKER: &str = "__DONE__";

/// Default readiness sentinel (substring of the agent's startup line)
pub const DEFAULT_READINESS_SENTINEL: &str = "Browser started";

/// Default error tag prefix
pub const DEFAULT_ERROR_TAG: &str = "[error]";

/// Default daemon/system tag prefix
pub const DEFAULT_SYSTEM_TAG: &str = "[daemon]";

/// Default longest line held back before it is cut, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024;

/// One entry in the ordered tag table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRule {
    /// Literal line prefix
    pub prefix: String,
    /// Kind of event produced, with the prefix stripped
    pub kind: EventKind,
}

impl TagRule {
    /// Create a tag rule
    pub fn new(prefix: impl Into<String>, kind: EventKind) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
        }
    }
}

/// Protocol constants for the stdout decoder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramingConfig {
    /// Literal token delimiting one task's output from the next
    pub completion_marker: String,
    /// Literal substring whose first occurrence latches readiness
    pub readiness_sentinel: String,
    /// Tag prefixes, checked in order
    pub tags: Vec<TagRule>,
    /// Bytes after which an unterminated line is cut; 0 disables the limit
    pub max_line_length: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            readiness_sentinel: DEFAULT_READINESS_SENTINEL.to_string(),
            tags: vec![
                TagRule::new(DEFAULT_ERROR_TAG, EventKind::Error),
                TagRule::new(DEFAULT_SYSTEM_TAG, EventKind::System),
            ],
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Incremental UTF-8 decoding across chunk boundaries
///
/// Incomplete trailing sequences wait for the next chunk; invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[start..valid_end]).unwrap_or_default(),
                    );
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Decode whatever is left at end of stream
    fn flush(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Where the held-back text ends its first line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    /// Completion marker starting at this offset
    Marker(usize),
    /// `\n` or `\r` at this offset
    Terminator(usize),
    /// Over-long line, cut at this offset
    Cut(usize),
    /// Nothing yet; this many bytes have been searched
    Pending(usize),
}

/// Largest char boundary in `text` at or below `at`
fn floor_char_boundary(text: &str, at: usize) -> usize {
    let mut at = at.min(text.len());
    while !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Streaming decoder for the agent's stdout
#[derive(Debug)]
pub struct FramingDecoder {
    config: FramingConfig,
    utf8: Utf8Accumulator,
    /// Decoded text not yet terminated by a newline or marker
    text: String,
    /// Leading bytes of `text` already searched without finding a boundary
    scanned: usize,
    /// Readiness has been observed
    ready_latched: bool,
}

impl Default for FramingDecoder {
    fn default() -> Self {
        Self::new(FramingConfig::default())
    }
}

impl FramingDecoder {
    /// Create a decoder for the given protocol constants
    #[must_use]
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            utf8: Utf8Accumulator::default(),
            text: String::new(),
            scanned: 0,
            ready_latched: false,
        }
    }

    /// Whether the readiness sentinel has been seen
    #[must_use]
    pub fn is_ready_latched(&self) -> bool {
        self.ready_latched
    }

    /// Bytes and characters held back waiting for more input
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.text.len() + self.utf8.pending_len()
    }

    /// Feed one chunk; returns the events it completed, in stream order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        let decoded = self.utf8.decode(chunk);
        self.text.push_str(&decoded);

        let mut events = Vec::new();
        self.drain_terminated(&mut events);
        events
    }

    /// Flush at end of stream; the unterminated tail becomes a final line
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let tail = self.utf8.flush();
        self.text.push_str(&tail);

        let mut events = Vec::new();
        self.drain_terminated(&mut events);
        let rest = std::mem::take(&mut self.text);
        self.scanned = 0;
        self.emit_line(&rest, &mut events);
        events
    }

    /// Decode a complete byte stream in one go
    pub fn decode_all(&mut self, bytes: &[u8]) -> Vec<AgentEvent> {
        let mut events = self.push(bytes);
        events.extend(self.finish());
        events
    }

    fn drain_terminated(&mut self, events: &mut Vec<AgentEvent>) {
        let mut text = std::mem::take(&mut self.text);
        let marker_len = self.config.completion_marker.len();
        let mut start = 0;

        loop {
            let line = &text[start..];
            match self.next_boundary(line) {
                Boundary::Marker(at) => {
                    self.emit_line(&line[..at], events);
                    events.push(AgentEvent::TaskDone);
                    start += at + marker_len;
                }
                Boundary::Terminator(at) => {
                    self.emit_line(&line[..at], events);
                    start += at + 1;
                }
                Boundary::Cut(at) => {
                    tracing::debug!(bytes = at, "Cutting over-long agent output line");
                    self.emit_line(&line[..at], events);
                    start += at;
                }
                Boundary::Pending(searched) => {
                    self.scanned = searched;
                    break;
                }
            }
            self.scanned = 0;
        }

        text.drain(..start);
        self.text = text;
    }

    /// Find the end of the first line in `line`
    ///
    /// Searching resumes where the previous push stopped; the marker search
    /// backs off by one marker length minus one so a marker split across
    /// pushes is still found.
    fn next_boundary(&self, line: &str) -> Boundary {
        let marker = self.config.completion_marker.as_str();
        let scanned = self.scanned.min(line.len());

        let terminator = line.as_bytes()[scanned..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
            .map(|i| i + scanned);

        let marker_at = if marker.is_empty() {
            None
        } else {
            let from = floor_char_boundary(line, scanned.saturating_sub(marker.len() - 1));
            let to = terminator.unwrap_or(line.len());
            line[from..to].find(marker).map(|i| i + from)
        };

        let max = self.config.max_line_length;
        let boundary = match (marker_at, terminator) {
            (Some(at), _) => Some(Boundary::Marker(at)),
            (None, Some(at)) => Some(Boundary::Terminator(at)),
            (None, None) => None,
        };

        match boundary {
            Some(Boundary::Marker(at) | Boundary::Terminator(at)) if max > 0 && at > max => {
                Boundary::Cut(Self::cut_point(line, max))
            }
            Some(found) => found,
            // A marker starting at or before `max` would already be visible
            None if max > 0 && line.len() >= max + marker.len().max(1) => {
                Boundary::Cut(Self::cut_point(line, max))
            }
            None => Boundary::Pending(line.len()),
        }
    }

    /// Cut offset for an over-long line: `max` bytes, never inside a character
    fn cut_point(line: &str, max: usize) -> usize {
        match floor_char_boundary(line, max) {
            0 => line.chars().next().map_or(0, char::len_utf8),
            at => at,
        }
    }

    fn emit_line(&mut self, line: &str, events: &mut Vec<AgentEvent>) {
        if let Some(event) = self.classify_line(line) {
            events.push(event);
        }
    }

    /// Classify one terminated line
    fn classify_line(&mut self, line: &str) -> Option<AgentEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if !self.ready_latched
            && !self.config.readiness_sentinel.is_empty()
            && trimmed.contains(self.config.readiness_sentinel.as_str())
        {
            self.ready_latched = true;
            return Some(AgentEvent::ReadinessChanged(true));
        }

        for tag in &self.config.tags {
            if let Some(rest) = trimmed.strip_prefix(tag.prefix.as_str()) {
                let rest = rest.trim();
                if rest.is_empty() {
                    return None;
                }
                return Some(tag.kind.with_text(rest));
            }
        }

        Some(AgentEvent::AgentOutput(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCENARIO: &str = "hello__DONE__[error] boom\n[daemon] restarting__DONE__world";

    fn decode_in_chunks(bytes: &[u8], chunk_size: usize) -> Vec<AgentEvent> {
        decode_in_chunks_with(FramingConfig::default(), bytes, chunk_size)
    }

    fn decode_in_chunks_with(
        config: FramingConfig,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Vec<AgentEvent> {
        let mut decoder = FramingDecoder::new(config);
        let mut events = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn test_marker_scenario() {
        let events = FramingDecoder::default().decode_all(SCENARIO.as_bytes());
        assert_eq!(
            events,
            vec![
                AgentEvent::output("hello"),
                AgentEvent::TaskDone,
                AgentEvent::error("boom"),
                AgentEvent::system("restarting"),
                AgentEvent::TaskDone,
                AgentEvent::output("world"),
            ]
        );
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let stream = "[daemon] Browser started. Provider: google, Model: gemini\n\
                      [agent] Running: find the café menu ☕\n\
                      step one done__DONE__\n\
                      [error] näive failure 💥\n__DONE__\ntrailing";
        let whole = FramingDecoder::default().decode_all(stream.as_bytes());
        for size in 1..=17 {
            assert_eq!(
                decode_in_chunks(stream.as_bytes(), size),
                whole,
                "chunk size {size}"
            );
        }
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut decoder = FramingDecoder::default();
        assert!(decoder.push(b"result__DO").is_empty());
        assert_eq!(
            decoder.push(b"NE__"),
            vec![AgentEvent::output("result"), AgentEvent::TaskDone]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let bytes = "ok ✓\n".as_bytes();
        let (a, b) = bytes.split_at(4); // splits the 3-byte check mark
        let mut decoder = FramingDecoder::default();
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec![AgentEvent::output("ok ✓")]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let events = FramingDecoder::default().decode_all(b"bad \xff byte\n");
        assert_eq!(events, vec![AgentEvent::output("bad \u{FFFD} byte")]);
    }

    #[test]
    fn test_task_done_count_matches_markers() {
        let stream = "__DONE__a__DONE____DONE__\n__DONE__b";
        let events = FramingDecoder::default().decode_all(stream.as_bytes());
        let done = events.iter().filter(|e| **e == AgentEvent::TaskDone).count();
        assert_eq!(done, stream.matches(DEFAULT_COMPLETION_MARKER).count());
        assert_eq!(
            events,
            vec![
                AgentEvent::TaskDone,
                AgentEvent::output("a"),
                AgentEvent::TaskDone,
                AgentEvent::TaskDone,
                AgentEvent::TaskDone,
                AgentEvent::output("b"),
            ]
        );
    }

    #[test]
    fn test_readiness_latches_once() {
        let stream = "[daemon] Browser started. Provider: openai\n\
                      Browser started again\n\
                      [daemon] Browser started twice\n";
        let mut decoder = FramingDecoder::default();
        let events = decoder.decode_all(stream.as_bytes());
        assert!(decoder.is_ready_latched());
        assert_eq!(
            events,
            vec![
                AgentEvent::ReadinessChanged(true),
                AgentEvent::output("Browser started again"),
                AgentEvent::system("Browser started twice"),
            ]
        );
    }

    #[test]
    fn test_blank_segments_and_bare_tags_produce_nothing() {
        let events = FramingDecoder::default().decode_all(b"  \n\r\n[error]   \n__DONE__\n");
        assert_eq!(events, vec![AgentEvent::TaskDone]);
    }

    #[test]
    fn test_unterminated_text_is_held_back() {
        let mut decoder = FramingDecoder::default();
        assert!(decoder.push(b"partial line").is_empty());
        assert_eq!(decoder.buffered(), "partial line".len());
        assert_eq!(decoder.finish(), vec![AgentEvent::output("partial line")]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_custom_tag_table_is_ordered() {
        let config = FramingConfig {
            completion_marker: "<<END>>".to_string(),
            readiness_sentinel: "READY".to_string(),
            tags: vec![
                TagRule::new("[err]", EventKind::Error),
                TagRule::new("[e", EventKind::System),
            ],
            ..FramingConfig::default()
        };
        let events = FramingDecoder::new(config).decode_all(b"READY\n[err] x\n[eh] y<<END>>");
        assert_eq!(
            events,
            vec![
                AgentEvent::ReadinessChanged(true),
                AgentEvent::error("x"),
                AgentEvent::system("h] y"),
                AgentEvent::TaskDone,
            ]
        );
    }

    #[test]
    fn test_carriage_return_ends_line() {
        let mut decoder = FramingDecoder::default();
        let events = decoder.push(b"Browser started\nstep 1/3\rstep 2/3\rstep 3/3\r");
        assert_eq!(
            events,
            vec![
                AgentEvent::ReadinessChanged(true),
                AgentEvent::output("step 1/3"),
                AgentEvent::output("step 2/3"),
                AgentEvent::output("step 3/3"),
            ]
        );
        assert_eq!(decoder.buffered(), 0);

        // CRLF still yields one line
        assert_eq!(
            FramingDecoder::default().decode_all(b"a\r\nb\r\n"),
            vec![AgentEvent::output("a"), AgentEvent::output("b")]
        );
    }

    #[test]
    fn test_long_line_is_cut() {
        let config = FramingConfig {
            max_line_length: 16,
            ..FramingConfig::default()
        };
        let mut decoder = FramingDecoder::new(config);
        let line = "x".repeat(40);

        let mut events = Vec::new();
        for chunk in line.as_bytes().chunks(5) {
            events.extend(decoder.push(chunk));
        }
        assert_eq!(
            events,
            vec![
                AgentEvent::output("x".repeat(16)),
                AgentEvent::output("x".repeat(16)),
            ]
        );
        assert_eq!(decoder.buffered(), 8);
        assert_eq!(decoder.finish(), vec![AgentEvent::output("x".repeat(8))]);
    }

    #[test]
    fn test_unterminated_flood_stays_bounded() {
        let mut decoder = FramingDecoder::default();
        let chunk = vec![b'x'; 4096];
        let mut emitted = 0;

        for _ in 0..1024 {
            for event in decoder.push(&chunk) {
                assert_eq!(event, AgentEvent::output("x".repeat(DEFAULT_MAX_LINE_LENGTH)));
                emitted += 1;
            }
            assert!(decoder.buffered() < DEFAULT_MAX_LINE_LENGTH + DEFAULT_COMPLETION_MARKER.len());
        }

        assert_eq!(emitted, 1024 * 4096 / DEFAULT_MAX_LINE_LENGTH - 1);
        assert_eq!(decoder.finish().len(), 1);
    }

    #[test]
    fn test_cut_lines_are_chunk_invariant() {
        let config = FramingConfig {
            max_line_length: 8,
            ..FramingConfig::default()
        };
        let stream = "abcdefg__DONE__0123456789abcdef\rcafé crème brûlée__DONE__\n\
                      [error] a long failure message\nshort\nxxxxxxxxx__DONE__tail";
        let whole = FramingDecoder::new(config.clone()).decode_all(stream.as_bytes());

        assert_eq!(whole[0], AgentEvent::output("abcdefg"));
        assert_eq!(whole[1], AgentEvent::TaskDone);
        assert_eq!(whole[2], AgentEvent::output("01234567"));
        assert_eq!(
            whole.iter().filter(|e| **e == AgentEvent::TaskDone).count(),
            stream.matches(DEFAULT_COMPLETION_MARKER).count()
        );

        for size in 1..=17 {
            assert_eq!(
                decode_in_chunks_with(config.clone(), stream.as_bytes(), size),
                whole,
                "chunk size {size}"
            );
        }
    }
}
