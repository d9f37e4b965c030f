//! Incremental matching loop
//!
//! Reads a connection just far enough, in filter order, to evaluate each
//! filter against one shared buffer that only ever grows. The first
//! satisfied filter ends the call.
//!
//! Stream conditions never surface as errors:
//! - end of stream freezes the buffer and the remaining filters still run
//! - any other read failure ends the call as "not matched"

use std::io::{ErrorKind, Read};

use log::debug;
use serde::Deserialize;

use super::filter::{BuildError, FilterChain, PatternSpec};
use super::source::{read_full, Fill};

/// What to do with bytes returned by a read that hit the end of the stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialRead {
    /// Append them to the buffer before freezing it
    #[default]
    Keep,
    /// Freeze the buffer as it was before the short read
    Discard,
}

/// Result of one matching call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Index into the chain of the first filter that matched
    Matched { filter: usize },
    /// Every filter was evaluated, none matched
    Unmatched,
    /// A read failed for a reason other than end of stream
    Aborted(ErrorKind),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Bytes obtained so far; equals the buffer length
    Reading { read: usize },
    /// The stream ended; no more reads for this call
    Exhausted,
}

/// Per-call state
struct MatchState {
    buffer: Vec<u8>,
    phase: Phase,
}

impl MatchState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            phase: Phase::Reading { read: 0 },
        }
    }

    /// Make sure `threshold` bytes are buffered, reading only the missing
    /// tail. Returns the transport error kind if the call must abort.
    fn fill_to<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        threshold: usize,
        policy: PartialRead,
    ) -> Result<(), ErrorKind> {
        let read = match self.phase {
            Phase::Reading { read } => read,
            Phase::Exhausted => return Ok(()),
        };

        let needed = threshold.saturating_sub(read);
        if needed == 0 {
            return Ok(());
        }

        let start = self.buffer.len();
        self.buffer.resize(start + needed, 0);

        match read_full(reader, &mut self.buffer[start..]) {
            Fill::Complete => {
                self.phase = Phase::Reading {
                    read: read + needed,
                };
                Ok(())
            }
            Fill::Short(n) => {
                let keep = match policy {
                    PartialRead::Keep => n,
                    PartialRead::Discard => 0,
                };
                self.buffer.truncate(start + keep);
                self.phase = Phase::Exhausted;
                debug!(
                    "Stream ended after {} of {} bytes, buffer frozen at {} bytes",
                    read + n,
                    threshold,
                    self.buffer.len()
                );
                Ok(())
            }
            Fill::Failed { read: n, error } => {
                self.buffer.truncate(start);
                debug!(
                    "Read failed after {} bytes ({}), treating connection as unmatched",
                    read + n,
                    error
                );
                Err(error.kind())
            }
        }
    }
}

/// Sniffs the leading bytes of a connection against a filter chain.
///
/// Immutable after construction and safe to share across connections.
#[derive(Clone, Debug, Default)]
pub struct PeekMatcher {
    chain: FilterChain,
    partial_read: PartialRead,
}

impl PeekMatcher {
    pub fn new(chain: FilterChain) -> Self {
        Self {
            chain,
            partial_read: PartialRead::default(),
        }
    }

    /// Build the chain and matcher in one step
    pub fn from_specs(prefixes: &[String], patterns: &[PatternSpec]) -> Result<Self, BuildError> {
        FilterChain::build(prefixes, patterns).map(Self::new)
    }

    pub fn with_partial_read(mut self, policy: PartialRead) -> Self {
        self.partial_read = policy;
        self
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn partial_read(&self) -> PartialRead {
        self.partial_read
    }

    /// Whether the connection's leading bytes satisfy any filter
    pub fn matches<R: Read + ?Sized>(&self, reader: &mut R) -> bool {
        self.match_source(reader).is_match()
    }

    /// Run the chain against `reader`, reporting which filter matched
    pub fn match_source<R: Read + ?Sized>(&self, reader: &mut R) -> MatchOutcome {
        let mut state = MatchState::new();

        for (index, filter) in self.chain.filters().iter().enumerate() {
            if let Err(kind) = state.fill_to(reader, filter.threshold(), self.partial_read) {
                return MatchOutcome::Aborted(kind);
            }

            if filter.is_match(&state.buffer) {
                debug!(
                    "Filter #{} ({}) matched on {} bytes",
                    index,
                    filter.describe(),
                    state.buffer.len()
                );
                return MatchOutcome::Matched { filter: index };
            }
        }

        MatchOutcome::Unmatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Serves `data` then ends, counting bytes handed out and read calls
    struct Counting {
        data: Vec<u8>,
        pos: usize,
        calls: usize,
    }

    impl Counting {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                calls: 0,
            }
        }
    }

    impl Read for Counting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Serves `data` then fails with `kind`
    struct Failing {
        data: Cursor<Vec<u8>>,
        kind: ErrorKind,
    }

    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(self.kind.into()),
                n => Ok(n),
            }
        }
    }

    /// Panics on any read
    struct Untouchable;

    impl Read for Untouchable {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("matcher must not read");
        }
    }

    #[test]
    fn test_prefix_reads_only_what_it_needs() {
        let matcher = PeekMatcher::from_specs(&strings(&["SSH-"]), &[]).unwrap();
        let mut conn = Counting::new(b"SSH-2.0");

        assert!(matcher.matches(&mut conn));
        assert_eq!(conn.pos, 4);
    }

    #[test]
    fn test_short_stream_cannot_satisfy_longer_prefix() {
        let matcher = PeekMatcher::from_specs(&strings(&["HELLO"]), &[]).unwrap();
        let mut conn = Counting::new(b"HE");

        assert_eq!(matcher.match_source(&mut conn), MatchOutcome::Unmatched);
        assert_eq!(conn.pos, 2);
    }

    #[test]
    fn test_first_filter_short_circuits() {
        let matcher = PeekMatcher::from_specs(&strings(&["A", "AB"]), &[]).unwrap();
        let mut conn = Counting::new(b"AB");

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 0 }
        );
        assert_eq!(conn.pos, 1);
    }

    #[test]
    fn test_pattern_matches_frozen_buffer() {
        let matcher = PeekMatcher::from_specs(&[], &[PatternSpec::new("^GET", 5)]).unwrap();
        let mut conn = Cursor::new(b"GET".to_vec());

        assert!(matcher.matches(&mut conn));
    }

    #[test]
    fn test_empty_chain_never_reads() {
        let matcher =
            PeekMatcher::from_specs(&strings(&[""]), &[PatternSpec::new("", 0)]).unwrap();

        assert_eq!(
            matcher.match_source(&mut Untouchable),
            MatchOutcome::Unmatched
        );
    }

    #[test]
    fn test_buffer_grows_by_missing_tail() {
        let matcher = PeekMatcher::from_specs(
            &strings(&["XYZ", "GET /"]),
            &[PatternSpec::new("HTTP", 8)],
        )
        .unwrap();
        let mut conn = Counting::new(b"GET / HTTP/1.1\r\n");

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 1 }
        );
        // "XYZ" pulled 3 bytes, "GET /" pulled 2 more
        assert_eq!(conn.pos, 5);
        assert_eq!(conn.calls, 2);
    }

    #[test]
    fn test_smaller_threshold_after_larger_reads_nothing_more() {
        let matcher = PeekMatcher::from_specs(
            &strings(&["GET / HTTP", "GET"]),
            &[],
        )
        .unwrap();
        let mut conn = Counting::new(b"GET /index HTTP/1.1");

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 1 }
        );
        assert_eq!(conn.pos, 10);
        assert_eq!(conn.calls, 1);
    }

    #[test]
    fn test_exhausted_stream_is_not_read_again() {
        let matcher = PeekMatcher::from_specs(
            &strings(&["LONGPREFIX", "LONGERPREFIX"]),
            &[PatternSpec::new("^SH", 0)],
        )
        .unwrap();
        let mut conn = Counting::new(b"SHORT");

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 2 }
        );
        // One read filled 5 bytes, the next returned 0; nothing afterwards
        assert_eq!(conn.calls, 2);
    }

    #[test]
    fn test_partial_read_keep_and_discard() {
        let keep = PeekMatcher::from_specs(&[], &[PatternSpec::new("^GET", 5)]).unwrap();
        assert_eq!(keep.partial_read(), PartialRead::Keep);
        assert!(keep.matches(&mut Cursor::new(b"GET".to_vec())));

        let discard = keep.clone().with_partial_read(PartialRead::Discard);
        assert!(!discard.matches(&mut Cursor::new(b"GET".to_vec())));
    }

    #[test]
    fn test_discard_keeps_earlier_complete_reads() {
        let anchored = PeekMatcher::from_specs(&strings(&["HX"]), &[PatternSpec::new("^HG", 8)])
            .unwrap()
            .with_partial_read(PartialRead::Discard);
        // "HG" came from a complete read and survives the discarded tail
        assert!(anchored.matches(&mut Cursor::new(b"HGET".to_vec())));

        let tail = PeekMatcher::from_specs(&strings(&["HX"]), &[PatternSpec::new("GET", 8)])
            .unwrap()
            .with_partial_read(PartialRead::Discard);
        assert!(!tail.matches(&mut Cursor::new(b"HGET".to_vec())));
        assert!(tail
            .with_partial_read(PartialRead::Keep)
            .matches(&mut Cursor::new(b"HGET".to_vec())));
    }

    #[test]
    fn test_transport_error_is_swallowed() {
        let matcher = PeekMatcher::from_specs(&[], &[PatternSpec::new("^GET", 8)]).unwrap();
        let mut conn = Failing {
            data: Cursor::new(b"GET".to_vec()),
            kind: ErrorKind::ConnectionReset,
        };

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Aborted(ErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn test_transport_error_stops_later_filters() {
        // The second filter would match "AB" but the failing read aborts first
        let matcher = PeekMatcher::from_specs(&strings(&["ABCD", "AB"]), &[]).unwrap();
        let mut conn = Failing {
            data: Cursor::new(b"AB".to_vec()),
            kind: ErrorKind::BrokenPipe,
        };

        assert!(!matcher.matches(&mut conn));
    }

    #[test]
    fn test_unexpected_eof_counts_as_end_of_stream() {
        let matcher = PeekMatcher::from_specs(&strings(&["ABCD", "AB"]), &[]).unwrap();
        let mut conn = Failing {
            data: Cursor::new(b"AB".to_vec()),
            kind: ErrorKind::UnexpectedEof,
        };

        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 1 }
        );
    }

    #[test]
    fn test_order_decides_reported_filter() {
        let forward = PeekMatcher::from_specs(&strings(&["GE", "GET"]), &[]).unwrap();
        let reverse = PeekMatcher::from_specs(&strings(&["GET", "GE"]), &[]).unwrap();

        assert_eq!(
            forward.match_source(&mut Cursor::new(b"GET /".to_vec())),
            MatchOutcome::Matched { filter: 0 }
        );
        assert_eq!(
            reverse.match_source(&mut Cursor::new(b"GET /".to_vec())),
            MatchOutcome::Matched { filter: 0 }
        );
        assert_eq!(reverse.chain().filters()[0].describe(), "prefix:GET");
    }

    #[test]
    fn test_pattern_reuses_prefix_bytes() {
        let matcher = PeekMatcher::from_specs(
            &strings(&["\x16\x03\x03"]),
            &[PatternSpec::new(r"^\x16\x03[\x00-\x04]", 3)],
        )
        .unwrap();

        let mut conn = Counting::new(b"\x16\x03\x01\x02\x00");
        assert_eq!(
            matcher.match_source(&mut conn),
            MatchOutcome::Matched { filter: 1 }
        );
        assert_eq!(conn.pos, 3);
        assert_eq!(conn.calls, 1);

        assert_eq!(
            matcher.match_source(&mut Cursor::new(b"\x15\x03\x01".to_vec())),
            MatchOutcome::Unmatched
        );
    }

    #[test]
    fn test_patterns_match_non_utf8_bytes() {
        let tls = PeekMatcher::from_specs(&[], &[PatternSpec::new(r"^\x16\x03.", 3)]).unwrap();
        assert!(tls.matches(&mut Cursor::new(b"\x16\x03\x80".to_vec())));
        assert!(tls.matches(&mut Cursor::new(b"\x16\x03\xff".to_vec())));

        let any_four = PeekMatcher::from_specs(&[], &[PatternSpec::new("^.{4}", 4)]).unwrap();
        assert!(any_four.matches(&mut Cursor::new(vec![0xff, 0xfe, 0x00, 0x01])));

        let negated = PeekMatcher::from_specs(&[], &[PatternSpec::new("^[^A]$", 1)]).unwrap();
        assert!(negated.matches(&mut Cursor::new(vec![0x80])));

        // Escapes above 0x7f name single bytes
        let raw = PeekMatcher::from_specs(&[], &[PatternSpec::new(r"^\xff\xfe", 2)]).unwrap();
        assert!(raw.matches(&mut Cursor::new(vec![0xff, 0xfe])));

        // `.` still stops at a newline
        assert!(!any_four.matches(&mut Cursor::new(b"ab\ncd".to_vec())));
    }

    #[tokio::test]
    async fn test_shared_matcher_across_tasks() {
        let matcher = std::sync::Arc::new(
            PeekMatcher::from_specs(&strings(&["SSH-"]), &[PatternSpec::new("^(GET|POST) ", 16)])
                .unwrap(),
        );

        let inputs: Vec<(&'static [u8], bool)> = vec![
            (&b"SSH-2.0-OpenSSH"[..], true),
            (&b"POST /api HTTP/1.1"[..], true),
            (&b"\x16\x03\x01\x00"[..], false),
            (&b""[..], false),
        ];

        let mut handles = Vec::new();
        for (data, expected) in inputs {
            let matcher = matcher.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let mut conn = Cursor::new(data.to_vec());
                (matcher.matches(&mut conn), expected)
            }));
        }

        for handle in handles {
            let (got, expected) = handle.await.unwrap();
            assert_eq!(got, expected);
        }
    }
}
